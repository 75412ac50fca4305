//! Realtime sync engine
//!
//! Applies change events of one pipeline, one event at a time, in queue
//! order. Every handler subscribed to the event's source type runs
//! concurrently; the checkpoint moves only after all of them succeeded.
//! A failing handler halts the pipeline with the checkpoint left at the last
//! fully applied event, so a restart replays from there.
//!
//! ```text
//! listener ──► mpsc (bounded) ──► dispatcher ──┬─► handler A ─┐
//!                                              ├─► handler B ─┼─► advance_checkpoint
//!                                              └─► handler C ─┘
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use searchsync_storage::{ResumeToken, SyncStateStore};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::change::{ChangeEvent, ChangeKind, ChangeSource};
use crate::entity::SearchEntity;
use crate::error::{Result, SyncError};
use crate::index_store::{DocumentQuery, IndexStore};
use crate::metrics::SyncMetricsTracker;
use crate::retry::RetryPolicy;

/// Applies change events of the source types it subscribes to.
///
/// Handlers must be idempotent: after a crash the events since the last
/// checkpoint are delivered again.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &str;

    fn source_types(&self) -> Vec<String>;

    async fn handle(&self, event: &ChangeEvent) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeReport {
    pub pipeline: String,
    pub events_applied: u64,
    pub last_tokens: HashMap<String, ResumeToken>,
}

pub struct RealtimeSyncEngine {
    pipeline: String,
    state: Arc<dyn SyncStateStore>,
    metrics: SyncMetricsTracker,
    handlers: Vec<Arc<dyn ChangeHandler>>,
    retry: RetryPolicy,
}

impl RealtimeSyncEngine {
    pub fn new(
        pipeline: impl Into<String>,
        state: Arc<dyn SyncStateStore>,
        metrics: SyncMetricsTracker,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            state,
            metrics,
            handlers: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ChangeHandler>) -> Self {
        self.register_handler(handler);
        self
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.push(handler);
    }

    /// Retry policy for checkpoint writes
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Union of the handlers' source types, sorted
    pub fn source_types(&self) -> Vec<String> {
        self.handlers
            .iter()
            .flat_map(|h| h.source_types())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Saved checkpoints of this pipeline, keyed by source type
    pub async fn resume_tokens(&self) -> Result<HashMap<String, ResumeToken>> {
        let checkpoints = self.state.list_checkpoints(&self.pipeline).await?;
        Ok(checkpoints
            .into_iter()
            .map(|cp| (cp.source_type, cp.last_applied_token))
            .collect())
    }

    /// Resume tokens for every subscribed source type.
    ///
    /// A source type without a checkpoint is anchored at the feed's current
    /// position, and that position is saved before anything subscribes.
    /// Changes made after this call are therefore replayed by a later session
    /// even if this one never applies them.
    pub async fn anchored_resume_tokens(
        &self,
        source: &dyn ChangeSource,
    ) -> Result<HashMap<String, ResumeToken>> {
        let mut tokens = self.resume_tokens().await?;
        let unanchored: Vec<String> = self
            .source_types()
            .into_iter()
            .filter(|source_type| !tokens.contains_key(source_type))
            .collect();
        if unanchored.is_empty() {
            return Ok(tokens);
        }

        for (source_type, token) in source.current_position(&unanchored).await? {
            self.state
                .advance_checkpoint(&self.pipeline, &source_type, &token)
                .await?;
            info!(
                pipeline = %self.pipeline,
                source_type = %source_type,
                token = %token,
                "Anchored checkpoint at the change feed tail"
            );
            tokens.insert(source_type, token);
        }
        Ok(tokens)
    }

    fn handlers_for(&self, source_type: &str) -> Vec<Arc<dyn ChangeHandler>> {
        self.handlers
            .iter()
            .filter(|h| h.source_types().iter().any(|s| s == source_type))
            .cloned()
            .collect()
    }

    /// Consume `events` until the queue closes, `shutdown` trips, or a
    /// handler fails.
    ///
    /// On failure `halt` is cancelled and the error returned. If `halt` is
    /// tripped by another pipeline sharing it, this returns
    /// [`SyncError::PipelineHalted`] without touching further events.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ChangeEvent>,
        shutdown: CancellationToken,
        halt: CancellationToken,
    ) -> Result<RealtimeReport> {
        let mut report = RealtimeReport {
            pipeline: self.pipeline.clone(),
            ..Default::default()
        };
        info!(
            pipeline = %self.pipeline,
            handlers = self.handlers.len(),
            "Realtime sync started"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = halt.cancelled() => {
                    info!(pipeline = %self.pipeline, "Halted by a sibling pipeline");
                    return Err(SyncError::PipelineHalted(self.pipeline.clone()));
                }
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let source_type = event.source_type.clone();
            let token = event.resume_token.clone();
            if let Err(e) = self.apply_event(event).await {
                halt.cancel();
                error!(
                    pipeline = %self.pipeline,
                    source_type = %source_type,
                    token = %token,
                    error = %e,
                    "Pipeline halted"
                );
                return Err(e);
            }
            report.events_applied += 1;
            report.last_tokens.insert(source_type, token);
        }

        info!(
            pipeline = %self.pipeline,
            events = report.events_applied,
            "Realtime sync stopped"
        );
        Ok(report)
    }

    /// Run every subscribed handler on `event`, then advance the checkpoint.
    pub async fn apply_event(&self, event: ChangeEvent) -> Result<()> {
        let started = Instant::now();
        let handlers = self.handlers_for(&event.source_type);
        let event = Arc::new(event);

        if !handlers.is_empty() {
            let mut tasks = JoinSet::new();
            for handler in handlers {
                let event = event.clone();
                tasks.spawn(async move {
                    let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
                    (handler.name().to_string(), outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let failure = match joined {
                    Ok((_, Ok(Ok(())))) => continue,
                    Ok((name, Ok(Err(e)))) => (name, e.to_string()),
                    Ok((name, Err(panic))) => (name, format!("panicked: {}", panic_message(&*panic))),
                    Err(e) => ("<unknown>".to_string(), e.to_string()),
                };
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}

                self.metrics.record_event(&event.source_type, false);
                return Err(SyncError::HandlerFailed {
                    handler: failure.0,
                    source_type: event.source_type.clone(),
                    token: event.resume_token.to_string(),
                    reason: failure.1,
                });
            }
        }

        let advanced = self
            .retry
            .execute("advance_checkpoint", || {
                self.state
                    .advance_checkpoint(&self.pipeline, &event.source_type, &event.resume_token)
            })
            .await?;
        if !advanced {
            debug!(
                pipeline = %self.pipeline,
                source_type = %event.source_type,
                token = %event.resume_token,
                "Replayed event behind the checkpoint"
            );
        }

        self.metrics.record_latency(&event.source_type, started.elapsed());
        self.metrics.record_event(&event.source_type, true);
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn require_document<'a>(event: &'a ChangeEvent) -> Result<&'a Value> {
    event.full_document.as_ref().ok_or_else(|| {
        SyncError::change_source(format!(
            "{} change {} of {} carries no document",
            event.kind.as_str(),
            event.resume_token,
            event.document_id
        ))
    })
}

fn ids_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Number(n)) => vec![n.to_string()],
        Some(Value::Array(items)) => items.iter().flat_map(|v| ids_of(Some(v))).collect(),
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keeps an entity's own documents in step with its backing rows.
pub struct EntityViewHandler {
    name: String,
    entity: Arc<SearchEntity>,
    store: Arc<dyn IndexStore>,
}

impl EntityViewHandler {
    pub fn new(entity: Arc<SearchEntity>, store: Arc<dyn IndexStore>) -> Self {
        Self {
            name: format!("{}-view", entity.entity_type().to_lowercase()),
            entity,
            store,
        }
    }
}

#[async_trait]
impl ChangeHandler for EntityViewHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_types(&self) -> Vec<String> {
        vec![self.entity.source_type().to_string()]
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<()> {
        let alias = self.entity.alias();
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let record = require_document(event)?;
                match self.entity.view().to_document(record) {
                    Some(doc) => {
                        self.store.upsert_document(alias, &doc).await?;
                    }
                    // No longer searchable
                    None => {
                        self.store.delete_document(alias, &event.document_id).await?;
                    }
                }
            }
            ChangeKind::Delete => {
                self.store.delete_document(alias, &event.document_id).await?;
            }
        }
        Ok(())
    }
}

pub type ElementProjection = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Documents fetched per page when scanning a target by id
const SCAN_PAGE_SIZE: usize = 500;

/// One page of ids matching `query`, in id order
async fn id_page(
    store: &dyn IndexStore,
    target: &str,
    query: &DocumentQuery,
) -> Result<Vec<String>> {
    let docs = store.search(target, query).await?;
    Ok(docs.into_iter().map(|d| d.id).collect())
}

/// Maintains a list of child elements inside parent documents.
///
/// A child row names its parents in `parent_field` (one id or an array).
/// Inserts append the projected element. Updates rewrite it in place on its
/// current parents, append it where it is missing and remove it from parents
/// it left. Deletes remove it. Elements are identified by `key_field`.
///
/// Former parents come from the event's pre-image. Without one, every
/// document of the target is scanned page by page.
pub struct ListProjectionHandler {
    name: String,
    source_type: String,
    target: String,
    list_field: String,
    key_field: String,
    parent_field: String,
    project: ElementProjection,
    max_len: Option<usize>,
    store: Arc<dyn IndexStore>,
}

impl ListProjectionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        target: impl Into<String>,
        list_field: impl Into<String>,
        key_field: impl Into<String>,
        parent_field: impl Into<String>,
        project: ElementProjection,
        store: Arc<dyn IndexStore>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            target: target.into(),
            list_field: list_field.into(),
            key_field: key_field.into(),
            parent_field: parent_field.into(),
            project,
            max_len: None,
            store,
        }
    }

    /// Keep only the newest `max_len` elements
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    fn element_key(&self, element: &Value, event: &ChangeEvent) -> Value {
        element
            .get(&self.key_field)
            .cloned()
            .unwrap_or_else(|| Value::String(event.document_id.clone()))
    }

    /// Key of the element projected from `record`, or the row id
    fn key_of(&self, record: &Value, event: &ChangeEvent) -> Value {
        (self.project)(record)
            .map(|element| self.element_key(&element, event))
            .unwrap_or_else(|| Value::String(event.document_id.clone()))
    }

    async fn remove_from(&self, parents: &[String], key: Value) -> Result<()> {
        if parents.is_empty() {
            return Ok(());
        }
        let report = self
            .store
            .remove_from_list(&self.target, &self.list_field, parents, &self.key_field, key)
            .await?;
        debug!(
            handler = %self.name,
            applied = report.applied(),
            "Removed list element"
        );
        Ok(())
    }

    /// Remove `key` from every document of the target except `keep`.
    async fn remove_everywhere_except(&self, keep: &[String], key: Value) -> Result<()> {
        let mut query = DocumentQuery::all(SCAN_PAGE_SIZE);
        loop {
            let page = id_page(self.store.as_ref(), &self.target, &query).await?;
            let Some(last) = page.last().cloned() else {
                return Ok(());
            };
            let full = page.len() >= SCAN_PAGE_SIZE;
            let former: Vec<String> = page.into_iter().filter(|id| !keep.contains(id)).collect();
            self.remove_from(&former, key.clone()).await?;
            if !full {
                return Ok(());
            }
            query = query.after(last);
        }
    }

    /// Rewrite the element on `parents` that hold it and append it to those
    /// that do not.
    async fn upsert_into(&self, parents: &[String], key: &Value, element: Value) -> Result<()> {
        if let Value::Object(fields) = &element {
            for (field, value) in fields {
                if *field == self.key_field {
                    continue;
                }
                self.store
                    .update_list_element(
                        &self.target,
                        &self.list_field,
                        parents,
                        &self.key_field,
                        key.clone(),
                        field,
                        value.clone(),
                    )
                    .await?;
            }
        }
        let report = self
            .store
            .append_to_list(
                &self.target,
                &self.list_field,
                parents,
                element,
                &self.key_field,
                self.max_len,
            )
            .await?;
        debug!(
            handler = %self.name,
            appended = report.applied(),
            missing = report.missing(),
            "Upserted list element"
        );
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler for ListProjectionHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_types(&self) -> Vec<String> {
        vec![self.source_type.clone()]
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            ChangeKind::Insert => {
                let record = require_document(event)?;
                let parents = ids_of(record.get(&self.parent_field));
                let Some(element) = (self.project)(record) else {
                    return Ok(());
                };
                if parents.is_empty() {
                    return Ok(());
                }
                let report = self
                    .store
                    .append_to_list(
                        &self.target,
                        &self.list_field,
                        &parents,
                        element,
                        &self.key_field,
                        self.max_len,
                    )
                    .await?;
                debug!(
                    handler = %self.name,
                    applied = report.applied(),
                    unchanged = report.unchanged(),
                    missing = report.missing(),
                    "Appended list element"
                );
            }
            ChangeKind::Update => {
                let record = require_document(event)?;
                let element = (self.project)(record);
                // A row that no longer projects is dropped from every parent
                let parents = if element.is_some() {
                    ids_of(record.get(&self.parent_field))
                } else {
                    Vec::new()
                };

                match &event.previous_document {
                    Some(pre_image) => {
                        let former: Vec<String> = ids_of(pre_image.get(&self.parent_field))
                            .into_iter()
                            .filter(|id| !parents.contains(id))
                            .collect();
                        self.remove_from(&former, self.key_of(pre_image, event))
                            .await?;
                    }
                    None => {
                        self.remove_everywhere_except(&parents, self.key_of(record, event))
                            .await?;
                    }
                }

                if let Some(element) = element {
                    if !parents.is_empty() {
                        let key = self.element_key(&element, event);
                        self.upsert_into(&parents, &key, element).await?;
                    }
                }
            }
            ChangeKind::Delete => match &event.full_document {
                Some(pre_image) => {
                    let parents = ids_of(pre_image.get(&self.parent_field));
                    self.remove_from(&parents, self.key_of(pre_image, event))
                        .await?;
                }
                None => {
                    self.remove_everywhere_except(&[], Value::String(event.document_id.clone()))
                        .await?;
                }
            },
        }
        Ok(())
    }
}

/// Copies one field of a source row into every document that references it.
///
/// Keeps denormalised values (for instance a project name stored on each of
/// its services) current. Referencing documents are found by an exact match
/// of `reference_field` against the changed row's id.
pub struct DenormalizedFieldHandler {
    name: String,
    source_type: String,
    target: String,
    reference_field: String,
    source_field: String,
    target_field: String,
    store: Arc<dyn IndexStore>,
}

impl DenormalizedFieldHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        target: impl Into<String>,
        reference_field: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
        store: Arc<dyn IndexStore>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            target: target.into(),
            reference_field: reference_field.into(),
            source_field: source_field.into(),
            target_field: target_field.into(),
            store,
        }
    }
}

#[async_trait]
impl ChangeHandler for DenormalizedFieldHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_types(&self) -> Vec<String> {
        vec![self.source_type.clone()]
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<()> {
        let value = match event.kind {
            ChangeKind::Insert | ChangeKind::Update => require_document(event)?
                .get(&self.source_field)
                .cloned()
                .unwrap_or(Value::Null),
            ChangeKind::Delete => Value::Null,
        };

        let mut query = DocumentQuery::all(SCAN_PAGE_SIZE).filter(
            self.reference_field.clone(),
            Value::String(event.document_id.clone()),
        );
        let mut applied = 0;
        loop {
            let ids = id_page(self.store.as_ref(), &self.target, &query).await?;
            let Some(last) = ids.last().cloned() else {
                break;
            };
            let report = self
                .store
                .set_field(&self.target, &ids, &self.target_field, value.clone())
                .await?;
            applied += report.applied();
            if ids.len() < SCAN_PAGE_SIZE {
                break;
            }
            query = query.after(last);
        }
        debug!(handler = %self.name, applied, "Refreshed denormalized field");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{identity_view, InMemoryRecordSource};
    use crate::index_store::{AliasAction, Document, IndexSchema, InMemoryIndexStore};
    use searchsync_storage::InMemorySyncStateStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(source: &str, kind: ChangeKind, seq: u64, id: &str, doc: Option<Value>) -> ChangeEvent {
        ChangeEvent::new(source, kind, ResumeToken::from_sequence(seq), id, doc)
    }

    async fn aliased_store(alias: &str) -> Arc<InMemoryIndexStore> {
        let store = Arc::new(InMemoryIndexStore::new());
        let index = format!("{alias}_idx");
        store.create_index(&index, &IndexSchema::new()).await.unwrap();
        store
            .update_aliases(alias, &[AliasAction::Add { index }])
            .await
            .unwrap();
        store
    }

    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ChangeHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn source_types(&self) -> Vec<String> {
            vec!["service".to_string()]
        }
        async fn handle(&self, _event: &ChangeEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Other(anyhow::anyhow!("index rejected write")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_checkpoint_advances_after_all_handlers() {
        let state = Arc::new(InMemorySyncStateStore::new());
        let ok = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let engine = RealtimeSyncEngine::new("search", state.clone(), SyncMetricsTracker::new())
            .with_handler(ok.clone())
            .with_retry(RetryPolicy::none());

        engine
            .apply_event(event("service", ChangeKind::Insert, 3, "s1", None))
            .await
            .unwrap();
        let cp = state.get_checkpoint("search", "service").await.unwrap().unwrap();
        assert_eq!(cp.last_applied_token, ResumeToken::from_sequence(3));
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_checkpoint_untouched() {
        let state = Arc::new(InMemorySyncStateStore::new());
        let engine = RealtimeSyncEngine::new("search", state.clone(), SyncMetricsTracker::new())
            .with_handler(Arc::new(Counting {
                calls: AtomicU32::new(0),
                fail: false,
            }))
            .with_handler(Arc::new(Counting {
                calls: AtomicU32::new(0),
                fail: true,
            }));

        engine
            .apply_event(event("service", ChangeKind::Insert, 1, "s1", None))
            .await
            .unwrap_err();
        assert!(state.get_checkpoint("search", "service").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_without_handlers_still_advance() {
        let state = Arc::new(InMemorySyncStateStore::new());
        let engine = RealtimeSyncEngine::new("search", state.clone(), SyncMetricsTracker::new());
        engine
            .apply_event(event("audit", ChangeKind::Insert, 9, "a1", None))
            .await
            .unwrap();
        assert!(state.get_checkpoint("search", "audit").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_entity_view_handler_upserts_and_deletes() {
        let store = aliased_store("service_search").await;
        let entity = Arc::new(SearchEntity::new(
            "Service",
            1,
            "service",
            identity_view("id"),
            Arc::new(InMemoryRecordSource::default()),
        ));
        let handler = EntityViewHandler::new(entity, store.clone());
        assert_eq!(handler.name(), "service-view");

        let doc = json!({"id": "s1", "name": "checkout"});
        handler
            .handle(&event("service", ChangeKind::Insert, 1, "s1", Some(doc.clone())))
            .await
            .unwrap();
        assert_eq!(
            store.get_document("service_search", "s1").await.unwrap(),
            Some(doc)
        );

        handler
            .handle(&event("service", ChangeKind::Delete, 2, "s1", None))
            .await
            .unwrap();
        assert!(store.get_document("service_search", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_projection_lifecycle() {
        let store = aliased_store("service_search").await;
        store
            .upsert_document("service_search", &Document::new("svc", json!({"id": "svc"})))
            .await
            .unwrap();

        let project: ElementProjection = Arc::new(|row: &Value| {
            let id = row.get("id")?.clone();
            let status = row.get("status")?.clone();
            Some(json!({"id": id, "status": status}))
        });
        let handler = ListProjectionHandler::new(
            "recent-executions",
            "execution",
            "service_search",
            "executions",
            "id",
            "service_id",
            project,
            store.clone(),
        )
        .with_max_len(2);

        for (seq, id) in [(1, "e1"), (2, "e2"), (3, "e3")] {
            let row = json!({"id": id, "service_id": "svc", "status": "RUNNING"});
            handler
                .handle(&event("execution", ChangeKind::Insert, seq, id, Some(row)))
                .await
                .unwrap();
        }
        let doc = store.get_document("service_search", "svc").await.unwrap().unwrap();
        let ids: Vec<&str> = doc["executions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["e2", "e3"]);

        let updated = json!({"id": "e3", "service_id": "svc", "status": "SUCCESS"});
        handler
            .handle(&event("execution", ChangeKind::Update, 4, "e3", Some(updated.clone())))
            .await
            .unwrap();
        let doc = store.get_document("service_search", "svc").await.unwrap().unwrap();
        assert_eq!(doc["executions"][1]["status"], "SUCCESS");

        handler
            .handle(&event("execution", ChangeKind::Delete, 5, "e3", Some(updated)))
            .await
            .unwrap();
        handler
            .handle(&event("execution", ChangeKind::Delete, 6, "e2", None))
            .await
            .unwrap();
        let doc = store.get_document("service_search", "svc").await.unwrap().unwrap();
        assert!(doc["executions"].as_array().unwrap().is_empty());
    }

    fn execution_ids(doc: &Value) -> Vec<String> {
        doc.get("executions")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|e| e["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_list_projection_follows_parent_changes() {
        let store = aliased_store("service_search").await;
        for id in ["svc-a", "svc-b"] {
            store
                .upsert_document("service_search", &Document::new(id, json!({"id": id})))
                .await
                .unwrap();
        }
        let project: ElementProjection = Arc::new(|row: &Value| {
            Some(json!({"id": row.get("id")?.clone(), "status": row.get("status")?.clone()}))
        });
        let handler = ListProjectionHandler::new(
            "recent-executions",
            "execution",
            "service_search",
            "executions",
            "id",
            "service_id",
            project,
            store.clone(),
        );
        let doc_of = |id: &'static str| {
            let store = store.clone();
            async move { store.get_document("service_search", id).await.unwrap().unwrap() }
        };

        let on_a = json!({"id": "e1", "service_id": "svc-a", "status": "RUNNING"});
        handler
            .handle(&event("execution", ChangeKind::Insert, 1, "e1", Some(on_a.clone())))
            .await
            .unwrap();

        // Moved with a pre-image: only the former parent is touched
        let on_b = json!({"id": "e1", "service_id": "svc-b", "status": "SUCCESS"});
        let moved = event("execution", ChangeKind::Update, 2, "e1", Some(on_b))
            .with_previous_document(on_a);
        handler.handle(&moved).await.unwrap();
        assert!(execution_ids(&doc_of("svc-a").await).is_empty());
        let b = doc_of("svc-b").await;
        assert_eq!(execution_ids(&b), vec!["e1"]);
        assert_eq!(b["executions"][0]["status"], "SUCCESS");

        // Moved back without a pre-image: found by scanning the target
        let back = json!({"id": "e1", "service_id": "svc-a", "status": "FAILED"});
        handler
            .handle(&event("execution", ChangeKind::Update, 3, "e1", Some(back)))
            .await
            .unwrap();
        assert!(execution_ids(&doc_of("svc-b").await).is_empty());
        let a = doc_of("svc-a").await;
        assert_eq!(execution_ids(&a), vec!["e1"]);
        assert_eq!(a["executions"][0]["status"], "FAILED");

        // An update for an element never inserted adds it
        let late = json!({"id": "e2", "service_id": "svc-b", "status": "RUNNING"});
        handler
            .handle(&event("execution", ChangeKind::Update, 4, "e2", Some(late)))
            .await
            .unwrap();
        assert_eq!(execution_ids(&doc_of("svc-b").await), vec!["e2"]);
        assert_eq!(execution_ids(&doc_of("svc-a").await), vec!["e1"]);
    }

    #[tokio::test]
    async fn test_denormalized_field_reaches_every_page() {
        let store = aliased_store("service_search").await;
        let referencing = SCAN_PAGE_SIZE * 2 + 50;
        for i in 0..referencing {
            let id = format!("svc-{i:05}");
            store
                .upsert_document(
                    "service_search",
                    &Document::new(id, json!({"project_id": "p1", "project_name": "old"})),
                )
                .await
                .unwrap();
        }
        for id in ["other-1", "other-2"] {
            store
                .upsert_document(
                    "service_search",
                    &Document::new(id, json!({"project_id": "p2", "project_name": "Billing"})),
                )
                .await
                .unwrap();
        }
        let handler = DenormalizedFieldHandler::new(
            "project-name",
            "project",
            "service_search",
            "project_id",
            "name",
            "project_name",
            store.clone(),
        );

        handler
            .handle(&event(
                "project",
                ChangeKind::Update,
                1,
                "p1",
                Some(json!({"id": "p1", "name": "Payments"})),
            ))
            .await
            .unwrap();

        let stale = store
            .search(
                "service_search",
                &DocumentQuery::all(usize::MAX).filter("project_name", json!("old")),
            )
            .await
            .unwrap();
        assert!(stale.is_empty(), "{} documents kept the old name", stale.len());
        let renamed = store
            .search(
                "service_search",
                &DocumentQuery::all(usize::MAX).filter("project_name", json!("Payments")),
            )
            .await
            .unwrap();
        assert_eq!(renamed.len(), referencing);
        let other = store.get_document("service_search", "other-1").await.unwrap().unwrap();
        assert_eq!(other["project_name"], "Billing");
    }

    #[tokio::test]
    async fn test_denormalized_field_follows_source() {
        let store = aliased_store("service_search").await;
        for id in ["a", "b"] {
            store
                .upsert_document(
                    "service_search",
                    &Document::new(id, json!({"id": id, "project_id": "p1", "project_name": "old"})),
                )
                .await
                .unwrap();
        }
        let handler = DenormalizedFieldHandler::new(
            "project-name",
            "project",
            "service_search",
            "project_id",
            "name",
            "project_name",
            store.clone(),
        );

        handler
            .handle(&event(
                "project",
                ChangeKind::Update,
                1,
                "p1",
                Some(json!({"id": "p1", "name": "Payments"})),
            ))
            .await
            .unwrap();
        for id in ["a", "b"] {
            let doc = store.get_document("service_search", id).await.unwrap().unwrap();
            assert_eq!(doc["project_name"], "Payments");
        }
    }

    #[test]
    fn test_ids_of() {
        assert_eq!(ids_of(Some(&json!("a"))), vec!["a"]);
        assert_eq!(ids_of(Some(&json!(["a", 2]))), vec!["a", "2"]);
        assert!(ids_of(None).is_empty());
    }
}
