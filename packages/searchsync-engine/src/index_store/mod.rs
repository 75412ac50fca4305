//! IndexStore port
//!
//! Narrow abstraction over the document store the search service reads from.
//! Every write is idempotent and reports whether it changed anything, so a
//! redelivered change event can be told apart from a failure.
//!
//! ```text
//! RealtimeSyncEngine ─┐                      ┌─ InMemoryIndexStore
//!                     ├─► dyn IndexStore ◄───┤
//! BulkSyncEngine ─────┘        ▲             └─ TantivyIndexStore
//!                              │
//!                      RetryingIndexStore (transient errors)
//! ```
//!
//! `target` arguments accept either a concrete index name or an alias.
//! Writes through an alias require it to resolve to exactly one index.

pub mod memory;
pub mod mutation;
#[cfg(feature = "tantivy")]
pub mod tantivy_store;

pub use memory::InMemoryIndexStore;
pub use mutation::ListMutation;
#[cfg(feature = "tantivy")]
pub use tantivy_store::TantivyIndexStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::IndexError;
use crate::retry::RetryPolicy;

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// A search document: identity plus JSON source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Exact-match string, usable in [`DocumentQuery::filters`]
    Keyword,
    /// Tokenized full text
    Text,
    /// Kept in the source only
    Stored,
}

/// Field mapping handed to `create_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub fields: BTreeMap<String, FieldKind>,
}

impl IndexSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldKind::Keyword);
        self
    }

    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldKind::Text);
        self
    }

    pub fn stored(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldKind::Stored);
        self
    }

    pub fn fields_of(&self, kind: FieldKind) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(name, _)| name.as_str())
    }
}

/// One step of an atomic alias update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AliasAction {
    Add { index: String },
    Remove { index: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    /// The document changed
    Applied,
    /// Already in the requested state
    Unchanged,
    /// No document with that id
    Missing,
}

/// Per-document outcomes of a multi-target mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    pub outcomes: Vec<(String, MutationOutcome)>,
}

impl MutationReport {
    pub fn record(&mut self, id: impl Into<String>, outcome: MutationOutcome) {
        self.outcomes.push((id.into(), outcome));
    }

    fn count(&self, outcome: MutationOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn applied(&self) -> usize {
        self.count(MutationOutcome::Applied)
    }

    pub fn unchanged(&self) -> usize {
        self.count(MutationOutcome::Unchanged)
    }

    pub fn missing(&self) -> usize {
        self.count(MutationOutcome::Missing)
    }

    /// True when nothing was written (replay of an applied change)
    pub fn is_noop(&self) -> bool {
        self.applied() == 0
    }

    pub fn outcome_of(&self, id: &str) -> Option<MutationOutcome> {
        self.outcomes
            .iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, o)| *o)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    /// Full-text query over text fields
    pub text: Option<String>,
    /// Exact top-level field matches, all required
    pub filters: Vec<(String, Value)>,
    pub limit: usize,
    /// Keyset cursor: only ids strictly greater than this one
    #[serde(default)]
    pub after: Option<String>,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self {
            text: None,
            filters: Vec::new(),
            limit: 10,
            after: None,
        }
    }
}

impl DocumentQuery {
    pub fn all(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Continue after the last id of a previous page.
    ///
    /// Queries without text return hits in id order, so feeding back the last
    /// id of each page walks every match exactly once.
    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after = Some(id.into());
        self
    }

    /// Whether `id` lies past the cursor
    pub fn is_past_cursor(&self, id: &str) -> bool {
        self.after.as_deref().map_or(true, |after| id > after)
    }

    /// Whether `source` satisfies every filter
    pub fn matches_filters(&self, source: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| source.get(field) == Some(expected))
    }
}

/// IndexStore port.
///
/// The required methods are the primitives a backend provides. The list
/// mutations are provided on top of [`IndexStore::apply_mutation`].
#[async_trait]
pub trait IndexStore: Send + Sync {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn create_index(&self, name: &str, schema: &IndexSchema) -> IndexResult<()>;

    /// Drop the index and detach it from any alias. `false` if absent.
    async fn delete_index(&self, name: &str) -> IndexResult<bool>;

    async fn index_exists(&self, name: &str) -> IndexResult<bool>;

    async fn list_indices(&self) -> IndexResult<Vec<String>>;

    /// Apply every action or none of them
    async fn update_aliases(&self, alias: &str, actions: &[AliasAction]) -> IndexResult<()>;

    /// Indices the alias currently resolves to, sorted
    async fn indices_for_alias(&self, alias: &str) -> IndexResult<Vec<String>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Documents
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create or replace, visible to reads on return
    async fn upsert_document(&self, target: &str, doc: &Document) -> IndexResult<MutationOutcome>;

    async fn delete_document(&self, target: &str, id: &str) -> IndexResult<MutationOutcome>;

    async fn get_document(&self, target: &str, id: &str) -> IndexResult<Option<Value>>;

    async fn count_documents(&self, target: &str) -> IndexResult<usize>;

    async fn search(&self, target: &str, query: &DocumentQuery) -> IndexResult<Vec<Document>>;

    /// Apply `mutation` to each of `ids`. Missing ids are reported, not errors.
    async fn apply_mutation(
        &self,
        target: &str,
        ids: &[String],
        mutation: &ListMutation,
    ) -> IndexResult<MutationReport>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Provided operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn attach_index_to_alias(&self, alias: &str, index: &str) -> IndexResult<()> {
        self.update_aliases(
            alias,
            &[AliasAction::Add {
                index: index.to_string(),
            }],
        )
        .await
    }

    async fn detach_index_from_alias(&self, alias: &str, index: &str) -> IndexResult<()> {
        self.update_aliases(
            alias,
            &[AliasAction::Remove {
                index: index.to_string(),
            }],
        )
        .await
    }

    async fn append_to_list(
        &self,
        target: &str,
        list_field: &str,
        ids: &[String],
        element: Value,
        key_field: &str,
        max_len: Option<usize>,
    ) -> IndexResult<MutationReport> {
        let mutation = ListMutation::Append {
            list_field: list_field.to_string(),
            key_field: key_field.to_string(),
            element,
            max_len,
        };
        self.apply_mutation(target, ids, &mutation).await
    }

    async fn remove_from_list(
        &self,
        target: &str,
        list_field: &str,
        ids: &[String],
        key_field: &str,
        key: Value,
    ) -> IndexResult<MutationReport> {
        let mutation = ListMutation::Remove {
            list_field: list_field.to_string(),
            key_field: key_field.to_string(),
            key,
        };
        self.apply_mutation(target, ids, &mutation).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_list_element(
        &self,
        target: &str,
        list_field: &str,
        ids: &[String],
        key_field: &str,
        key: Value,
        field: &str,
        value: Value,
    ) -> IndexResult<MutationReport> {
        let mutation = ListMutation::UpdateElement {
            list_field: list_field.to_string(),
            key_field: key_field.to_string(),
            key,
            field: field.to_string(),
            value,
        };
        self.apply_mutation(target, ids, &mutation).await
    }

    async fn add_timestamp(
        &self,
        target: &str,
        field: &str,
        ids: &[String],
        timestamp: DateTime<Utc>,
        retention_days: u32,
    ) -> IndexResult<MutationReport> {
        let mutation = ListMutation::AddTimestamp {
            field: field.to_string(),
            timestamp,
            retention_days,
        };
        self.apply_mutation(target, ids, &mutation).await
    }

    async fn set_field(
        &self,
        target: &str,
        ids: &[String],
        field: &str,
        value: Value,
    ) -> IndexResult<MutationReport> {
        let mutation = ListMutation::SetField {
            field: field.to_string(),
            value,
        };
        self.apply_mutation(target, ids, &mutation).await
    }
}

/// Pick the single index an alias write should go to.
pub(crate) fn single_write_index(
    target: &str,
    aliased: Option<&Vec<String>>,
) -> IndexResult<Option<String>> {
    match aliased {
        None => Ok(None),
        Some(indices) if indices.len() == 1 => Ok(Some(indices[0].clone())),
        Some(indices) => Err(IndexError::AmbiguousAlias {
            alias: target.to_string(),
            count: indices.len(),
        }),
    }
}

/// Decorator retrying transient backend errors with a fixed delay.
///
/// Every wrapped operation is idempotent, so a retry after an ambiguous
/// failure cannot double-apply.
pub struct RetryingIndexStore {
    inner: Arc<dyn IndexStore>,
    policy: RetryPolicy,
}

impl RetryingIndexStore {
    pub fn new(inner: Arc<dyn IndexStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Arc<dyn IndexStore> {
        &self.inner
    }
}

#[async_trait]
impl IndexStore for RetryingIndexStore {
    async fn create_index(&self, name: &str, schema: &IndexSchema) -> IndexResult<()> {
        self.policy
            .execute("create_index", || self.inner.create_index(name, schema))
            .await
    }

    async fn delete_index(&self, name: &str) -> IndexResult<bool> {
        self.policy
            .execute("delete_index", || self.inner.delete_index(name))
            .await
    }

    async fn index_exists(&self, name: &str) -> IndexResult<bool> {
        self.policy
            .execute("index_exists", || self.inner.index_exists(name))
            .await
    }

    async fn list_indices(&self) -> IndexResult<Vec<String>> {
        self.policy
            .execute("list_indices", || self.inner.list_indices())
            .await
    }

    async fn update_aliases(&self, alias: &str, actions: &[AliasAction]) -> IndexResult<()> {
        self.policy
            .execute("update_aliases", || self.inner.update_aliases(alias, actions))
            .await
    }

    async fn indices_for_alias(&self, alias: &str) -> IndexResult<Vec<String>> {
        self.policy
            .execute("indices_for_alias", || self.inner.indices_for_alias(alias))
            .await
    }

    async fn upsert_document(&self, target: &str, doc: &Document) -> IndexResult<MutationOutcome> {
        self.policy
            .execute("upsert_document", || self.inner.upsert_document(target, doc))
            .await
    }

    async fn delete_document(&self, target: &str, id: &str) -> IndexResult<MutationOutcome> {
        self.policy
            .execute("delete_document", || self.inner.delete_document(target, id))
            .await
    }

    async fn get_document(&self, target: &str, id: &str) -> IndexResult<Option<Value>> {
        self.policy
            .execute("get_document", || self.inner.get_document(target, id))
            .await
    }

    async fn count_documents(&self, target: &str) -> IndexResult<usize> {
        self.policy
            .execute("count_documents", || self.inner.count_documents(target))
            .await
    }

    async fn search(&self, target: &str, query: &DocumentQuery) -> IndexResult<Vec<Document>> {
        self.policy
            .execute("search", || self.inner.search(target, query))
            .await
    }

    async fn apply_mutation(
        &self,
        target: &str,
        ids: &[String],
        mutation: &ListMutation,
    ) -> IndexResult<MutationReport> {
        self.policy
            .execute(mutation.name(), || {
                self.inner.apply_mutation(target, ids, mutation)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_mutation_report_counts() {
        let mut report = MutationReport::default();
        report.record("a", MutationOutcome::Applied);
        report.record("b", MutationOutcome::Unchanged);
        report.record("c", MutationOutcome::Missing);

        assert_eq!(report.applied(), 1);
        assert_eq!(report.unchanged(), 1);
        assert_eq!(report.missing(), 1);
        assert!(!report.is_noop());
        assert_eq!(report.outcome_of("b"), Some(MutationOutcome::Unchanged));
    }

    #[test]
    fn test_query_filters() {
        let query = DocumentQuery::all(5).filter("status", json!("active"));
        assert!(query.matches_filters(&json!({"status": "active", "name": "x"})));
        assert!(!query.matches_filters(&json!({"status": "paused"})));
        assert!(!query.matches_filters(&json!({})));
    }

    #[test]
    fn test_query_cursor() {
        let query = DocumentQuery::all(5);
        assert!(query.is_past_cursor("a"));

        let query = query.after("b");
        assert!(!query.is_past_cursor("a"));
        assert!(!query.is_past_cursor("b"));
        assert!(query.is_past_cursor("c"));

        let decoded: DocumentQuery =
            serde_json::from_value(json!({"text": null, "filters": [], "limit": 3})).unwrap();
        assert_eq!(decoded.after, None);
    }

    #[test]
    fn test_schema_builder() {
        let schema = IndexSchema::new().keyword("id").text("name").stored("tags");
        assert_eq!(schema.fields_of(FieldKind::Text).collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(schema.fields.len(), 3);
    }

    /// Fails `upsert_document` with `Unavailable` a fixed number of times.
    struct Flaky {
        inner: InMemoryIndexStore,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl IndexStore for Flaky {
        async fn create_index(&self, name: &str, schema: &IndexSchema) -> IndexResult<()> {
            self.inner.create_index(name, schema).await
        }
        async fn delete_index(&self, name: &str) -> IndexResult<bool> {
            self.inner.delete_index(name).await
        }
        async fn index_exists(&self, name: &str) -> IndexResult<bool> {
            self.inner.index_exists(name).await
        }
        async fn list_indices(&self) -> IndexResult<Vec<String>> {
            self.inner.list_indices().await
        }
        async fn update_aliases(&self, alias: &str, actions: &[AliasAction]) -> IndexResult<()> {
            self.inner.update_aliases(alias, actions).await
        }
        async fn indices_for_alias(&self, alias: &str) -> IndexResult<Vec<String>> {
            self.inner.indices_for_alias(alias).await
        }
        async fn upsert_document(&self, target: &str, doc: &Document) -> IndexResult<MutationOutcome> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(IndexError::Unavailable("connection reset".into()));
                }
            }
            self.inner.upsert_document(target, doc).await
        }
        async fn delete_document(&self, target: &str, id: &str) -> IndexResult<MutationOutcome> {
            self.inner.delete_document(target, id).await
        }
        async fn get_document(&self, target: &str, id: &str) -> IndexResult<Option<Value>> {
            self.inner.get_document(target, id).await
        }
        async fn count_documents(&self, target: &str) -> IndexResult<usize> {
            self.inner.count_documents(target).await
        }
        async fn search(&self, target: &str, query: &DocumentQuery) -> IndexResult<Vec<Document>> {
            self.inner.search(target, query).await
        }
        async fn apply_mutation(
            &self,
            target: &str,
            ids: &[String],
            mutation: &ListMutation,
        ) -> IndexResult<MutationReport> {
            self.inner.apply_mutation(target, ids, mutation).await
        }
    }

    #[tokio::test]
    async fn test_retrying_store_recovers_from_transient_errors() {
        let flaky = Arc::new(Flaky {
            inner: InMemoryIndexStore::new(),
            failures_left: Mutex::new(2),
        });
        flaky.create_index("svc", &IndexSchema::new()).await.unwrap();

        let store = RetryingIndexStore::new(flaky, RetryPolicy::fixed(3, Duration::from_millis(1)));
        let outcome = store
            .upsert_document("svc", &Document::new("1", json!({"name": "a"})))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(store.get_document("svc", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retrying_store_gives_up() {
        let flaky = Arc::new(Flaky {
            inner: InMemoryIndexStore::new(),
            failures_left: Mutex::new(5),
        });
        flaky.create_index("svc", &IndexSchema::new()).await.unwrap();

        let store = RetryingIndexStore::new(flaky, RetryPolicy::fixed(3, Duration::from_millis(1)));
        let err = store
            .upsert_document("svc", &Document::new("1", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
