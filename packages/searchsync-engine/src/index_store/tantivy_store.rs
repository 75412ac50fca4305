//! Tantivy IndexStore
//!
//! # Layout
//!
//! ```text
//! root/
//!   aliases.json            alias → [index, ...]
//!   service_2_1718000000/   one tantivy index per logical index
//!     searchsync_schema.json
//! ```
//!
//! Without a root directory every index lives in RAM.
//!
//! # Fields
//!
//! 1. `doc_id` - document id (STORED, raw keyword)
//! 2. `doc_source` - JSON source (STORED only)
//! 3. `doc_body` - concatenated text fields (indexed, not stored)
//! 4. `kw_<name>` - one raw keyword field per [`FieldKind::Keyword`]
//!
//! Partial mutations are read-modify-write on `doc_source`: the writer mutex
//! is held from the read to the commit, so two mutations of the same index
//! never interleave. Every write commits and reloads the reader, which gives
//! read-after-write visibility.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tantivy::{
    collector::TopDocs,
    doc,
    query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::{
        Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, TEXT,
    },
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};
use tracing::{debug, info};

use super::{
    single_write_index, AliasAction, Document, DocumentQuery, FieldKind, IndexResult, IndexSchema,
    IndexStore, ListMutation, MutationOutcome, MutationReport,
};
use crate::error::IndexError;

const FIELD_ID: &str = "doc_id";
const FIELD_SOURCE: &str = "doc_source";
const FIELD_BODY: &str = "doc_body";
const KEYWORD_PREFIX: &str = "kw_";

const ALIASES_FILE: &str = "aliases.json";
const SCHEMA_FILE: &str = "searchsync_schema.json";

/// Writer heap per index; one indexing thread each
const WRITER_HEAP_BYTES: usize = 15_000_000;

fn keyword_options() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("raw")
                .set_index_option(IndexRecordOption::Basic),
        )
        .set_stored()
}

fn build_schema(schema: &IndexSchema) -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field(FIELD_ID, keyword_options());
    builder.add_text_field(FIELD_SOURCE, STORED);
    builder.add_text_field(FIELD_BODY, TEXT);
    for name in schema.fields_of(FieldKind::Keyword) {
        builder.add_text_field(&format!("{KEYWORD_PREFIX}{name}"), keyword_options());
    }
    builder.build()
}

/// Field handles (cached)
#[derive(Debug, Clone)]
struct SchemaFields {
    id: Field,
    source: Field,
    body: Field,
    keywords: HashMap<String, Field>,
}

impl SchemaFields {
    fn resolve(tantivy_schema: &Schema, schema: &IndexSchema) -> IndexResult<Self> {
        let field = |name: &str| tantivy_schema.get_field(name).map_err(IndexError::internal);
        let mut keywords = HashMap::new();
        for name in schema.fields_of(FieldKind::Keyword) {
            keywords.insert(name.to_string(), field(&format!("{KEYWORD_PREFIX}{name}"))?);
        }
        Ok(Self {
            id: field(FIELD_ID)?,
            source: field(FIELD_SOURCE)?,
            body: field(FIELD_BODY)?,
            keywords,
        })
    }
}

struct TantivyIndex {
    schema: IndexSchema,
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SchemaFields,
}

impl TantivyIndex {
    fn create(schema: &IndexSchema, dir: Option<&Path>) -> IndexResult<Self> {
        let tantivy_schema = build_schema(schema);
        let index = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    IndexError::Internal(format!("Failed to create index dir: {}", e))
                })?;
                let index = Index::create_in_dir(dir, tantivy_schema.clone())
                    .map_err(|e| IndexError::Internal(format!("Failed to create index: {}", e)))?;
                let meta = serde_json::to_vec_pretty(schema).map_err(IndexError::internal)?;
                std::fs::write(dir.join(SCHEMA_FILE), meta).map_err(IndexError::internal)?;
                index
            }
            None => Index::create_in_ram(tantivy_schema.clone()),
        };
        Self::from_index(schema.clone(), index)
    }

    fn open(dir: &Path) -> IndexResult<Self> {
        let meta = std::fs::read(dir.join(SCHEMA_FILE)).map_err(IndexError::internal)?;
        let schema: IndexSchema = serde_json::from_slice(&meta).map_err(IndexError::internal)?;
        let index = Index::open_in_dir(dir)
            .map_err(|e| IndexError::Internal(format!("Failed to open index: {}", e)))?;
        Self::from_index(schema, index)
    }

    fn from_index(schema: IndexSchema, index: Index) -> IndexResult<Self> {
        let fields = SchemaFields::resolve(&index.schema(), &schema)?;
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(|e| IndexError::Internal(format!("Failed to create writer: {}", e)))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| IndexError::Internal(format!("Failed to create reader: {}", e)))?;
        Ok(Self {
            schema,
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    fn build_document(&self, id: &str, source: &JsonValue) -> IndexResult<TantivyDocument> {
        let raw = serde_json::to_string(source).map_err(|e| IndexError::MalformedDocument {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let body = self
            .schema
            .fields_of(FieldKind::Text)
            .filter_map(|name| source.get(name))
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut doc = doc!(
            self.fields.id => id.to_string(),
            self.fields.source => raw,
            self.fields.body => body,
        );
        for (name, field) in &self.fields.keywords {
            if let Some(value) = source.get(name).and_then(|v| v.as_str()) {
                doc.add_text(*field, value);
            }
        }
        Ok(doc)
    }

    fn id_term(&self, id: &str) -> Term {
        Term::from_field_text(self.fields.id, id)
    }

    fn read_source(&self, id: &str) -> IndexResult<Option<JsonValue>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(self.id_term(id), IndexRecordOption::Basic);
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| IndexError::Internal(format!("Search failed: {}", e)))?;
        match top_docs.first() {
            None => Ok(None),
            Some((_, address)) => {
                let doc: TantivyDocument = searcher
                    .doc(*address)
                    .map_err(|e| IndexError::Internal(format!("Failed to retrieve doc: {}", e)))?;
                self.decode_source(id, &doc).map(Some)
            }
        }
    }

    fn decode_source(&self, id: &str, doc: &TantivyDocument) -> IndexResult<JsonValue> {
        let raw = doc
            .get_first(self.fields.source)
            .and_then(|v| v.as_str())
            .ok_or_else(|| IndexError::MalformedDocument {
                id: id.to_string(),
                reason: "stored source missing".to_string(),
            })?;
        serde_json::from_str(raw).map_err(|e| IndexError::MalformedDocument {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Replace (delete + add) without committing
    fn stage_replace(&self, writer: &IndexWriter, id: &str, source: &JsonValue) -> IndexResult<()> {
        let doc = self.build_document(id, source)?;
        writer.delete_term(self.id_term(id));
        writer
            .add_document(doc)
            .map_err(|e| IndexError::Internal(format!("Failed to add document: {}", e)))?;
        Ok(())
    }

    fn commit(&self, writer: &mut IndexWriter) -> IndexResult<()> {
        writer
            .commit()
            .map_err(|e| IndexError::Internal(format!("Failed to commit: {}", e)))?;
        self.reader
            .reload()
            .map_err(|e| IndexError::Internal(format!("Failed to reload reader: {}", e)))
    }

    fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    fn search(&self, query: &DocumentQuery) -> IndexResult<Vec<Document>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let parser = QueryParser::for_index(&self.index, vec![self.fields.body]);
            let parsed = parser
                .parse_query(text)
                .map_err(|e| IndexError::InvalidInput(format!("Invalid query: {}", e)))?;
            clauses.push((Occur::Must, parsed));
        }
        for (name, value) in &query.filters {
            if let (Some(field), Some(s)) = (self.fields.keywords.get(name), value.as_str()) {
                let term = Term::from_field_text(*field, s);
                clauses.push((
                    Occur::Must,
                    Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
                ));
            }
        }
        let combined: Box<dyn Query> = if clauses.is_empty() {
            Box::new(AllQuery)
        } else {
            Box::new(BooleanQuery::new(clauses))
        };

        let searcher = self.reader.searcher();
        // Filters on non-keyword fields are checked on the source, so fetch
        // every candidate and cut to the limit afterwards
        let candidates = (searcher.num_docs() as usize).max(1);
        let top_docs = searcher
            .search(&combined, &TopDocs::with_limit(candidates))
            .map_err(|e| IndexError::Internal(format!("Search failed: {}", e)))?;

        let mut hits = Vec::new();
        for (_score, address) in top_docs {
            // Text hits keep relevance order, so the limit can cut early
            if query.text.is_some() && hits.len() >= query.limit {
                break;
            }
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| IndexError::Internal(format!("Failed to retrieve doc: {}", e)))?;
            let id = doc
                .get_first(self.fields.id)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if !query.is_past_cursor(&id) {
                continue;
            }
            let source = self.decode_source(&id, &doc)?;
            if query.matches_filters(&source) {
                hits.push(Document::new(id, source));
            }
        }
        order_hits(query, &mut hits);
        Ok(hits)
    }
}

/// Id order for queries without text, then cut to the limit
fn order_hits(query: &DocumentQuery, hits: &mut Vec<Document>) {
    if query.text.is_none() {
        hits.sort_by(|a, b| a.id.cmp(&b.id));
    }
    hits.truncate(query.limit);
}

#[derive(Default)]
struct Catalog {
    indices: HashMap<String, Arc<TantivyIndex>>,
    aliases: HashMap<String, BTreeSet<String>>,
}

impl Catalog {
    fn resolve_read(&self, target: &str) -> IndexResult<Vec<Arc<TantivyIndex>>> {
        if let Some(members) = self.aliases.get(target) {
            return Ok(members
                .iter()
                .filter_map(|name| self.indices.get(name).cloned())
                .collect());
        }
        self.indices
            .get(target)
            .map(|index| vec![index.clone()])
            .ok_or_else(|| IndexError::IndexNotFound(target.to_string()))
    }

    fn resolve_write(&self, target: &str) -> IndexResult<Arc<TantivyIndex>> {
        let aliased: Option<Vec<String>> = self
            .aliases
            .get(target)
            .map(|set| set.iter().cloned().collect());
        let name = single_write_index(target, aliased.as_ref())?.unwrap_or_else(|| target.to_string());
        self.indices
            .get(&name)
            .cloned()
            .ok_or(IndexError::IndexNotFound(name))
    }
}

/// Tantivy-backed store (RAM or directory).
pub struct TantivyIndexStore {
    root: Option<PathBuf>,
    catalog: RwLock<Catalog>,
}

impl TantivyIndexStore {
    /// All indices in RAM
    pub fn in_memory() -> Self {
        Self {
            root: None,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    /// Open (or create) a store rooted at `root`, loading existing indices
    /// and aliases.
    pub fn open(root: impl Into<PathBuf>) -> IndexResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(IndexError::internal)?;

        let mut catalog = Catalog::default();
        let entries = std::fs::read_dir(&root).map_err(IndexError::internal)?;
        for entry in entries {
            let path = entry.map_err(IndexError::internal)?.path();
            if !path.join(SCHEMA_FILE).exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            catalog
                .indices
                .insert(name, Arc::new(TantivyIndex::open(&path)?));
        }

        let aliases_path = root.join(ALIASES_FILE);
        if aliases_path.exists() {
            let raw = std::fs::read(&aliases_path).map_err(IndexError::internal)?;
            catalog.aliases = serde_json::from_slice(&raw).map_err(IndexError::internal)?;
            // Drop members whose index directory is gone
            let known: BTreeSet<String> = catalog.indices.keys().cloned().collect();
            catalog.aliases.retain(|_, members| {
                members.retain(|m| known.contains(m));
                !members.is_empty()
            });
        }

        info!(
            root = %root.display(),
            indices = catalog.indices.len(),
            aliases = catalog.aliases.len(),
            "Opened tantivy index store"
        );
        Ok(Self {
            root: Some(root),
            catalog: RwLock::new(catalog),
        })
    }

    fn persist_aliases(&self, aliases: &HashMap<String, BTreeSet<String>>) -> IndexResult<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(aliases).map_err(IndexError::internal)?;
        let tmp = root.join(format!("{ALIASES_FILE}.tmp"));
        std::fs::write(&tmp, raw).map_err(IndexError::internal)?;
        // rename is atomic on the same filesystem
        std::fs::rename(&tmp, root.join(ALIASES_FILE)).map_err(IndexError::internal)
    }
}

#[async_trait]
impl IndexStore for TantivyIndexStore {
    async fn create_index(&self, name: &str, schema: &IndexSchema) -> IndexResult<()> {
        if name.is_empty() || name.contains(|c: char| matches!(c, '/' | '\\' | '.')) {
            return Err(IndexError::InvalidInput(format!("invalid index name '{}'", name)));
        }
        let mut catalog = self.catalog.write();
        if catalog.indices.contains_key(name) {
            return Err(IndexError::IndexAlreadyExists(name.to_string()));
        }
        if catalog.aliases.contains_key(name) {
            return Err(IndexError::InvalidInput(format!(
                "'{}' is already used as an alias",
                name
            )));
        }
        let dir = self.root.as_ref().map(|root| root.join(name));
        let index = TantivyIndex::create(schema, dir.as_deref())?;
        catalog.indices.insert(name.to_string(), Arc::new(index));
        debug!(index = name, "Created tantivy index");
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> IndexResult<bool> {
        let mut catalog = self.catalog.write();
        let Some(index) = catalog.indices.remove(name) else {
            return Ok(false);
        };
        let before = catalog.aliases.clone();
        catalog.aliases.retain(|_, members| {
            members.remove(name);
            !members.is_empty()
        });
        if catalog.aliases != before {
            self.persist_aliases(&catalog.aliases)?;
        }
        drop(index);

        if let Some(root) = &self.root {
            let dir = root.join(name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(IndexError::internal)?;
            }
        }
        debug!(index = name, "Deleted tantivy index");
        Ok(true)
    }

    async fn index_exists(&self, name: &str) -> IndexResult<bool> {
        Ok(self.catalog.read().indices.contains_key(name))
    }

    async fn list_indices(&self) -> IndexResult<Vec<String>> {
        let mut names: Vec<_> = self.catalog.read().indices.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn update_aliases(&self, alias: &str, actions: &[AliasAction]) -> IndexResult<()> {
        let mut catalog = self.catalog.write();
        if catalog.indices.contains_key(alias) {
            return Err(IndexError::InvalidInput(format!(
                "alias '{}' collides with an index name",
                alias
            )));
        }
        for action in actions {
            if let AliasAction::Add { index } = action {
                if !catalog.indices.contains_key(index) {
                    return Err(IndexError::IndexNotFound(index.clone()));
                }
            }
        }

        let mut next = catalog.aliases.clone();
        let mut members = next.remove(alias).unwrap_or_default();
        for action in actions {
            match action {
                AliasAction::Add { index } => {
                    members.insert(index.clone());
                }
                AliasAction::Remove { index } => {
                    members.remove(index);
                }
            }
        }
        if !members.is_empty() {
            next.insert(alias.to_string(), members);
        }

        // Persist first: a failed write leaves the in-memory view unchanged
        self.persist_aliases(&next)?;
        catalog.aliases = next;
        Ok(())
    }

    async fn indices_for_alias(&self, alias: &str) -> IndexResult<Vec<String>> {
        Ok(self
            .catalog
            .read()
            .aliases
            .get(alias)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_document(&self, target: &str, doc: &Document) -> IndexResult<MutationOutcome> {
        let index = self.catalog.read().resolve_write(target)?;
        let mut writer = index.writer.lock();
        if index.read_source(&doc.id)?.as_ref() == Some(&doc.source) {
            return Ok(MutationOutcome::Unchanged);
        }
        index.stage_replace(&writer, &doc.id, &doc.source)?;
        index.commit(&mut writer)?;
        Ok(MutationOutcome::Applied)
    }

    async fn delete_document(&self, target: &str, id: &str) -> IndexResult<MutationOutcome> {
        let index = self.catalog.read().resolve_write(target)?;
        let mut writer = index.writer.lock();
        if index.read_source(id)?.is_none() {
            return Ok(MutationOutcome::Missing);
        }
        writer.delete_term(index.id_term(id));
        index.commit(&mut writer)?;
        Ok(MutationOutcome::Applied)
    }

    async fn get_document(&self, target: &str, id: &str) -> IndexResult<Option<JsonValue>> {
        let indices = self.catalog.read().resolve_read(target)?;
        for index in indices {
            if let Some(source) = index.read_source(id)? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    async fn count_documents(&self, target: &str) -> IndexResult<usize> {
        let indices = self.catalog.read().resolve_read(target)?;
        Ok(indices.iter().map(|index| index.count()).sum())
    }

    async fn search(&self, target: &str, query: &DocumentQuery) -> IndexResult<Vec<Document>> {
        let indices = self.catalog.read().resolve_read(target)?;
        let mut hits = Vec::new();
        for index in indices {
            if query.text.is_some() && hits.len() >= query.limit {
                break;
            }
            hits.extend(index.search(query)?);
        }
        order_hits(query, &mut hits);
        Ok(hits)
    }

    async fn apply_mutation(
        &self,
        target: &str,
        ids: &[String],
        mutation: &ListMutation,
    ) -> IndexResult<MutationReport> {
        mutation.validate()?;
        let index = self.catalog.read().resolve_write(target)?;
        let now = Utc::now();
        let mut writer = index.writer.lock();

        let mut report = MutationReport::default();
        let mut staged = false;
        for id in ids {
            let outcome = match index.read_source(id)? {
                None => MutationOutcome::Missing,
                Some(mut source) => {
                    let applied = match mutation.apply(id, &mut source, now) {
                        Ok(applied) => applied,
                        Err(e) => {
                            // Discard whatever was staged for earlier ids
                            writer.rollback().map_err(IndexError::internal)?;
                            return Err(e);
                        }
                    };
                    if applied {
                        index.stage_replace(&writer, id, &source)?;
                        staged = true;
                        MutationOutcome::Applied
                    } else {
                        MutationOutcome::Unchanged
                    }
                }
            };
            report.record(id.clone(), outcome);
        }
        if staged {
            index.commit(&mut writer)?;
        }
        Ok(report)
    }
}
