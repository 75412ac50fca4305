//! In-Memory IndexStore
//!
//! BTreeMap-backed implementation for tests and embedded use. All state sits
//! behind one lock, so alias updates are trivially atomic and every write is
//! visible to the next read.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::{
    single_write_index, AliasAction, Document, DocumentQuery, FieldKind, IndexResult, IndexSchema,
    IndexStore, ListMutation, MutationOutcome, MutationReport,
};
use crate::error::IndexError;

#[derive(Debug, Default)]
struct MemoryIndex {
    schema: IndexSchema,
    docs: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct State {
    indices: HashMap<String, MemoryIndex>,
    aliases: HashMap<String, BTreeSet<String>>,
}

impl State {
    /// Indices a read against `target` covers
    fn resolve_read(&self, target: &str) -> IndexResult<Vec<String>> {
        if let Some(indices) = self.aliases.get(target) {
            return Ok(indices.iter().cloned().collect());
        }
        if self.indices.contains_key(target) {
            return Ok(vec![target.to_string()]);
        }
        Err(IndexError::IndexNotFound(target.to_string()))
    }

    fn resolve_write(&self, target: &str) -> IndexResult<String> {
        let aliased: Option<Vec<String>> = self
            .aliases
            .get(target)
            .map(|set| set.iter().cloned().collect());
        if let Some(index) = single_write_index(target, aliased.as_ref())? {
            return Ok(index);
        }
        if self.indices.contains_key(target) {
            return Ok(target.to_string());
        }
        Err(IndexError::IndexNotFound(target.to_string()))
    }

    fn index_mut(&mut self, target: &str) -> IndexResult<&mut MemoryIndex> {
        let name = self.resolve_write(target)?;
        self.indices
            .get_mut(&name)
            .ok_or(IndexError::IndexNotFound(name))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryIndexStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_text(schema: &IndexSchema, source: &Value, text: &str) -> bool {
    let mut text_fields = schema.fields_of(FieldKind::Text).peekable();
    let haystack = if text_fields.peek().is_some() {
        text_fields
            .filter_map(|f| source.get(f))
            .map(flatten_text)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        flatten_text(source)
    };
    let haystack = haystack.to_lowercase();

    text.split_whitespace()
        .all(|token| haystack.contains(&token.to_lowercase()))
}

fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(flatten_text).collect::<Vec<_>>().join(" "),
        Value::Object(map) => map.values().map(flatten_text).collect::<Vec<_>>().join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn create_index(&self, name: &str, schema: &IndexSchema) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.indices.contains_key(name) {
            return Err(IndexError::IndexAlreadyExists(name.to_string()));
        }
        if state.aliases.contains_key(name) {
            return Err(IndexError::InvalidInput(format!(
                "'{}' is already used as an alias",
                name
            )));
        }
        state.indices.insert(
            name.to_string(),
            MemoryIndex {
                schema: schema.clone(),
                docs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> IndexResult<bool> {
        let mut state = self.state.write();
        if state.indices.remove(name).is_none() {
            return Ok(false);
        }
        state.aliases.retain(|_, members| {
            members.remove(name);
            !members.is_empty()
        });
        Ok(true)
    }

    async fn index_exists(&self, name: &str) -> IndexResult<bool> {
        Ok(self.state.read().indices.contains_key(name))
    }

    async fn list_indices(&self) -> IndexResult<Vec<String>> {
        let mut names: Vec<_> = self.state.read().indices.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn update_aliases(&self, alias: &str, actions: &[AliasAction]) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.indices.contains_key(alias) {
            return Err(IndexError::InvalidInput(format!(
                "alias '{}' collides with an index name",
                alias
            )));
        }

        // Validate everything before touching the alias
        for action in actions {
            if let AliasAction::Add { index } = action {
                if !state.indices.contains_key(index) {
                    return Err(IndexError::IndexNotFound(index.clone()));
                }
            }
        }

        let mut members = state.aliases.remove(alias).unwrap_or_default();
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
            state.aliases.insert(alias.to_string(), members);
        }
        Ok(())
    }

    async fn indices_for_alias(&self, alias: &str) -> IndexResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .aliases
            .get(alias)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_document(&self, target: &str, doc: &Document) -> IndexResult<MutationOutcome> {
        let mut state = self.state.write();
        let index = state.index_mut(target)?;
        if index.docs.get(&doc.id) == Some(&doc.source) {
            return Ok(MutationOutcome::Unchanged);
        }
        index.docs.insert(doc.id.clone(), doc.source.clone());
        Ok(MutationOutcome::Applied)
    }

    async fn delete_document(&self, target: &str, id: &str) -> IndexResult<MutationOutcome> {
        let mut state = self.state.write();
        let index = state.index_mut(target)?;
        Ok(match index.docs.remove(id) {
            Some(_) => MutationOutcome::Applied,
            None => MutationOutcome::Missing,
        })
    }

    async fn get_document(&self, target: &str, id: &str) -> IndexResult<Option<Value>> {
        let state = self.state.read();
        for name in state.resolve_read(target)? {
            if let Some(source) = state.indices.get(&name).and_then(|i| i.docs.get(id)) {
                return Ok(Some(source.clone()));
            }
        }
        Ok(None)
    }

    async fn count_documents(&self, target: &str) -> IndexResult<usize> {
        let state = self.state.read();
        Ok(state
            .resolve_read(target)?
            .iter()
            .filter_map(|name| state.indices.get(name))
            .map(|index| index.docs.len())
            .sum())
    }

    async fn search(&self, target: &str, query: &DocumentQuery) -> IndexResult<Vec<Document>> {
        let state = self.state.read();
        let lower = match &query.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let mut hits = Vec::new();
        for name in state.resolve_read(target)? {
            let Some(index) = state.indices.get(&name) else {
                continue;
            };
            let matching = index
                .docs
                .range::<String, _>((lower.clone(), Bound::Unbounded))
                .filter(|(_, source)| query.matches_filters(source))
                .filter(|(_, source)| match &query.text {
                    Some(text) => matches_text(&index.schema, source, text),
                    None => true,
                })
                .take(query.limit)
                .map(|(id, source)| Document::new(id.clone(), source.clone()));
            hits.extend(matching);
        }
        // Indices behind one alias are merged back into id order
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn apply_mutation(
        &self,
        target: &str,
        ids: &[String],
        mutation: &ListMutation,
    ) -> IndexResult<MutationReport> {
        mutation.validate()?;
        let now = Utc::now();
        let mut state = self.state.write();
        let index = state.index_mut(target)?;

        let mut report = MutationReport::default();
        for id in ids {
            let outcome = match index.docs.get(id) {
                None => MutationOutcome::Missing,
                Some(source) => {
                    // Work on a copy so a malformed document is left untouched
                    let mut updated = source.clone();
                    if mutation.apply(id, &mut updated, now)? {
                        index.docs.insert(id.clone(), updated);
                        MutationOutcome::Applied
                    } else {
                        MutationOutcome::Unchanged
                    }
                }
            };
            report.record(id.clone(), outcome);
        }
        Ok(report)
    }
}
