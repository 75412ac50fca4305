//! Searchable entity types and their static registry
//!
//! An entity type ties together everything the engines need to keep one
//! alias in sync: the document view over system-of-record rows, the table
//! scan used for backfill, the schema version and the index schema.
//! Entity types are registered explicitly at startup; nothing is looked up
//! by name at runtime beyond this registry.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::index_store::{Document, IndexSchema};

/// A row of the system of record
pub type Record = Value;

pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Turns a record into its search document. `None` means the record has no
/// searchable representation and is skipped.
pub trait EntityView: Send + Sync {
    fn to_document(&self, record: &Record) -> Option<Document>;
}

impl<F> EntityView for F
where
    F: Fn(&Record) -> Option<Document> + Send + Sync,
{
    fn to_document(&self, record: &Record) -> Option<Document> {
        self(record)
    }
}

/// Full scan of an entity's backing table
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn scan(&self) -> Result<RecordStream>;
}

/// Vec-backed record source for tests and demos
#[derive(Clone, Default)]
pub struct InMemoryRecordSource {
    records: Arc<RwLock<Vec<Record>>>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub fn push(&self, record: Record) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn scan(&self) -> Result<RecordStream> {
        let snapshot = self.records.read().clone();
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }
}

/// Take the document id from `id_field` and index the record as-is.
pub fn identity_view(id_field: &str) -> Arc<dyn EntityView> {
    let id_field = id_field.to_string();
    Arc::new(move |record: &Record| {
        let id = match record.get(&id_field)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Document::new(id, record.clone()))
    })
}

pub struct SearchEntity {
    entity_type: String,
    version: u32,
    alias: String,
    source_type: String,
    schema: IndexSchema,
    view: Arc<dyn EntityView>,
    records: Arc<dyn RecordSource>,
}

impl SearchEntity {
    /// `source_type` is the change-feed source whose events carry this
    /// entity's records.
    pub fn new(
        entity_type: impl Into<String>,
        version: u32,
        source_type: impl Into<String>,
        view: Arc<dyn EntityView>,
        records: Arc<dyn RecordSource>,
    ) -> Self {
        let entity_type = entity_type.into();
        let alias = format!("{}_search", entity_type.to_lowercase());
        Self {
            entity_type,
            version,
            alias,
            source_type: source_type.into(),
            schema: IndexSchema::default(),
            view,
            records,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_schema(mut self, schema: IndexSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Serving alias readers query
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn view(&self) -> &Arc<dyn EntityView> {
        &self.view
    }

    pub fn records(&self) -> &Arc<dyn RecordSource> {
        &self.records
    }

    /// `{entity}_{version}_{unix_millis}`, lowercase
    pub fn index_name_at(&self, unix_millis: i64) -> String {
        format!(
            "{}_{}_{}",
            self.entity_type.to_lowercase(),
            self.version,
            unix_millis
        )
    }

    pub fn new_index_name(&self) -> String {
        self.index_name_at(Utc::now().timestamp_millis())
    }
}

impl fmt::Debug for SearchEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchEntity")
            .field("entity_type", &self.entity_type)
            .field("version", &self.version)
            .field("alias", &self.alias)
            .field("source_type", &self.source_type)
            .finish()
    }
}

/// Static registry of entity types, keyed by type name
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Arc<SearchEntity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: SearchEntity) -> Result<()> {
        if self.entities.contains_key(entity.entity_type()) {
            return Err(SyncError::DuplicateRegistration(format!(
                "entity type '{}'",
                entity.entity_type()
            )));
        }
        if self.entities.values().any(|e| e.alias() == entity.alias()) {
            return Err(SyncError::DuplicateRegistration(format!(
                "alias '{}'",
                entity.alias()
            )));
        }
        self.entities
            .insert(entity.entity_type().to_string(), Arc::new(entity));
        Ok(())
    }

    pub fn with(mut self, entity: SearchEntity) -> Result<Self> {
        self.register(entity)?;
        Ok(self)
    }

    pub fn get(&self, entity_type: &str) -> Result<Arc<SearchEntity>> {
        self.entities
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))
    }

    /// Entities fed by a change-feed source type
    pub fn by_source_type(&self, source_type: &str) -> Vec<Arc<SearchEntity>> {
        self.entities
            .values()
            .filter(|e| e.source_type() == source_type)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SearchEntity>> {
        self.entities.values()
    }

    pub fn entity_types(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
