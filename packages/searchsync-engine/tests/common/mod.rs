//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use searchsync_engine::{
    identity_view, ChangeEvent, ChangeHandler, InMemoryRecordSource, Record, RecordSource,
    RecordStream, SearchEntity, SyncError,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn service_rows(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"id": format!("svc-{i:03}"), "name": format!("service {i}"), "project": "payments"}))
        .collect()
}

pub fn service_entity(version: u32, records: Arc<dyn RecordSource>) -> SearchEntity {
    SearchEntity::new("Service", version, "service", identity_view("id"), records)
}

pub fn pipeline_entity(version: u32, records: Arc<dyn RecordSource>) -> SearchEntity {
    SearchEntity::new("Pipeline", version, "pipeline", identity_view("id"), records)
}

pub fn in_memory_services(count: usize) -> InMemoryRecordSource {
    InMemoryRecordSource::new(service_rows(count))
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Yields `good` rows, then fails, like a table scan whose connection drops.
pub struct FailingRecordSource {
    pub rows: Vec<Record>,
    pub good: usize,
}

#[async_trait]
impl RecordSource for FailingRecordSource {
    async fn scan(&self) -> searchsync_engine::Result<RecordStream> {
        let mut items: Vec<searchsync_engine::Result<Record>> =
            self.rows.iter().take(self.good).cloned().map(Ok).collect();
        items.push(Err(SyncError::Other(anyhow::anyhow!("connection reset during scan"))));
        Ok(stream::iter(items).boxed())
    }
}

/// Records every event and can be told to fail.
pub struct RecordingHandler {
    name: String,
    source_types: Vec<String>,
    pub seen: parking_lot::Mutex<Vec<ChangeEvent>>,
    pub fail: AtomicBool,
    pub calls: AtomicU32,
}

impl RecordingHandler {
    pub fn new(name: &str, source_types: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source_types: source_types.iter().map(|s| s.to_string()).collect(),
            seen: parking_lot::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn seen_ids(&self) -> Vec<String> {
        self.seen.lock().iter().map(|e| e.document_id.clone()).collect()
    }
}

#[async_trait]
impl ChangeHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_types(&self) -> Vec<String> {
        self.source_types.clone()
    }

    async fn handle(&self, event: &ChangeEvent) -> searchsync_engine::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Other(anyhow::anyhow!(
                "{} rejected {}",
                self.name,
                event.document_id
            )));
        }
        self.seen.lock().push(event.clone());
        Ok(())
    }
}
