//! Integration tests for the sync coordinator
//!
//! - Changes made during the backfill are applied once it finishes
//! - Stop releases the leader lock
//! - A demoted leader hands over to a standby
//! - A shared halt fails the whole session
//! - Changes made while no session runs are replayed by the next one

mod common;

use async_trait::async_trait;
use common::*;
use futures::stream::{self, StreamExt};
use searchsync_engine::{
    ChangeKind, EntityRegistry, IndexStore, InMemoryChangeSource, InMemoryIndexStore, PrimaryFlag,
    Record, RecordSource, RecordStream, ResumeToken, SessionOutcome, SyncComponents, SyncConfig,
    SyncCoordinator, SyncError,
};
use searchsync_storage::{InMemorySyncStateStore, SyncStateStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

/// Holds the table scan until the test opens the gate.
struct GatedRecordSource {
    rows: Vec<Record>,
    started: Notify,
    gate: Notify,
}

impl GatedRecordSource {
    fn new(rows: Vec<Record>) -> Arc<Self> {
        Arc::new(Self {
            rows,
            started: Notify::new(),
            gate: Notify::new(),
        })
    }
}

#[async_trait]
impl RecordSource for GatedRecordSource {
    async fn scan(&self) -> searchsync_engine::Result<RecordStream> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(stream::iter(self.rows.clone().into_iter().map(Ok)).boxed())
    }
}

struct Harness {
    state: Arc<InMemorySyncStateStore>,
    index: Arc<InMemoryIndexStore>,
    source: InMemoryChangeSource,
}

impl Harness {
    fn new() -> Self {
        Self {
            state: Arc::new(InMemorySyncStateStore::new()),
            index: Arc::new(InMemoryIndexStore::new()),
            source: InMemoryChangeSource::new(),
        }
    }

    fn components(&self, registry: EntityRegistry) -> SyncComponents {
        SyncComponents::new(
            SyncConfig::fast(),
            self.state.clone(),
            self.index.clone(),
            registry,
            Arc::new(self.source.clone()),
        )
    }

    async fn lock_owner(&self) -> Option<String> {
        self.state
            .get_lock("search_sync")
            .await
            .unwrap()
            .filter(|record| !record.is_expired())
            .map(|record| record.owner_id)
    }

    async fn wait_for_owner(&self, owner: &str) -> bool {
        let owner = owner.to_string();
        wait_until(WAIT, || {
            let owner = owner.clone();
            async move { self.lock_owner().await.as_deref() == Some(owner.as_str()) }
        })
        .await
    }
}

#[tokio::test]
async fn test_changes_during_backfill_apply_after_it() {
    let harness = Harness::new();
    let records = GatedRecordSource::new(service_rows(5));
    let registry = EntityRegistry::new()
        .with(service_entity(1, records.clone()))
        .unwrap();

    let components = harness.components(registry);
    let mut search = components.pipeline("search");
    for handler in components.entity_view_handlers() {
        search.register_handler(handler);
    }
    let components = components.with_pipeline(search).unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(components).unwrap());
    coordinator.start();

    // Listeners subscribe before the backfill scans the table
    tokio::time::timeout(WAIT, records.started.notified())
        .await
        .unwrap();
    harness.source.publish(
        "service",
        ChangeKind::Update,
        "svc-001",
        Some(json!({"id": "svc-001", "name": "renamed", "project": "payments"})),
    );
    harness.source.publish(
        "service",
        ChangeKind::Delete,
        "svc-002",
        Some(json!({"id": "svc-002"})),
    );
    harness.source.publish(
        "service",
        ChangeKind::Insert,
        "svc-100",
        Some(json!({"id": "svc-100", "name": "brand new", "project": "payments"})),
    );

    // Nothing is served until the backfill completes
    assert!(harness
        .index
        .indices_for_alias("service_search")
        .await
        .unwrap()
        .is_empty());
    records.gate.notify_one();

    let index = harness.index.clone();
    let settled = wait_until(WAIT, || {
        let index = index.clone();
        async move {
            let renamed = index
                .get_document("service_search", "svc-001")
                .await
                .ok()
                .flatten()
                .and_then(|doc| doc.get("name").cloned());
            let deleted = index
                .get_document("service_search", "svc-002")
                .await
                .is_ok_and(|doc| doc.is_none());
            let count = index.count_documents("service_search").await.unwrap_or(0);
            renamed == Some(json!("renamed")) && deleted && count == 5
        }
    })
    .await;
    assert!(settled);

    let checkpoint = harness
        .state
        .get_checkpoint("search", "service")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_applied_token, harness.source.last_token().unwrap());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_stop_releases_the_lock() {
    let harness = Harness::new();
    let registry = EntityRegistry::new()
        .with(service_entity(1, Arc::new(in_memory_services(3))))
        .unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(harness.components(registry)).unwrap());

    coordinator.start();
    assert!(harness.wait_for_owner(coordinator.owner_id()).await);
    assert!(coordinator.is_running());

    let index = harness.index.clone();
    let backfilled = wait_until(WAIT, || {
        let index = index.clone();
        async move { index.count_documents("service_search").await.unwrap_or(0) == 3 }
    })
    .await;
    assert!(backfilled);

    coordinator.stop().await;
    assert!(!coordinator.is_running());
    assert!(harness.state.get_lock("search_sync").await.unwrap().is_none());
}

#[tokio::test]
async fn test_standby_takes_over_after_demotion() {
    let harness = Harness::new();
    let records: Arc<dyn RecordSource> = Arc::new(in_memory_services(3));
    let registry = || {
        EntityRegistry::new()
            .with(service_entity(1, records.clone()))
            .unwrap()
    };

    let flag = PrimaryFlag::new(true);
    let leader = Arc::new(
        SyncCoordinator::new(
            harness
                .components(registry())
                .with_primary_status(Arc::new(flag.clone())),
        )
        .unwrap(),
    );
    leader.start();
    assert!(harness.wait_for_owner(leader.owner_id()).await);

    let standby = Arc::new(SyncCoordinator::new(harness.components(registry())).unwrap());
    standby.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.lock_owner().await.as_deref(), Some(leader.owner_id()));

    flag.set_primary(false);
    assert!(harness.wait_for_owner(standby.owner_id()).await);

    // The demoted process keeps trying but never wins while standby
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.lock_owner().await.as_deref(), Some(standby.owner_id()));

    // The entity was already current, nothing was rebuilt
    let state = harness.state.get_index_state("Service").await.unwrap().unwrap();
    assert_eq!(state.sync_version, 1);
    assert_eq!(harness.index.count_documents("service_search").await.unwrap(), 3);

    leader.stop().await;
    standby.stop().await;
}

#[tokio::test]
async fn test_shared_halt_fails_the_session() {
    let harness = Harness::new();
    let components = harness.components(EntityRegistry::new());

    let failing = RecordingHandler::new("failing", &["service"]);
    failing.set_failing(true);
    let healthy = RecordingHandler::new("healthy", &["pipeline"]);

    let a = components.pipeline("a").with_handler(failing.clone());
    let b = components.pipeline("b").with_handler(healthy.clone());
    let components = components.with_pipeline(a).unwrap().with_pipeline(b).unwrap();

    // Pipeline "a" resumes just before an event already in the log
    let poisoned = harness
        .source
        .publish("service", ChangeKind::Insert, "bad", Some(json!({"id": "bad"})));
    harness
        .state
        .advance_checkpoint("a", "service", &ResumeToken::from_sequence(0))
        .await
        .unwrap();

    let coordinator = SyncCoordinator::new(components).unwrap();
    let err = tokio::time::timeout(WAIT, coordinator.run_session())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        SyncError::HandlerFailed { handler, token, .. } => {
            assert_eq!(handler, "failing");
            assert_eq!(token, poisoned.as_str());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(healthy.seen_ids().is_empty());
    let checkpoint = harness.state.get_checkpoint("a", "service").await.unwrap().unwrap();
    assert_eq!(checkpoint.last_applied_token, ResumeToken::from_sequence(0));
    // The failed session still released the lock
    assert!(harness.state.get_lock("search_sync").await.unwrap().is_none());
}

#[tokio::test]
async fn test_changes_between_sessions_are_replayed() {
    let harness = Harness::new();
    let components = harness.components(EntityRegistry::new());
    let handler = RecordingHandler::new("recording", &["service"]);
    handler.set_failing(true);
    let search = components.pipeline("search").with_handler(handler.clone());
    let coordinator = Arc::new(
        SyncCoordinator::new(components.with_pipeline(search).unwrap()).unwrap(),
    );

    // First session: the starting position is saved before any change arrives
    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run_session().await }
    });
    let state = harness.state.clone();
    let anchored = wait_until(WAIT, || {
        let state = state.clone();
        async move {
            state
                .get_checkpoint("search", "service")
                .await
                .is_ok_and(|cp| cp.is_some())
        }
    })
    .await;
    assert!(anchored);

    let e1 = harness
        .source
        .publish("service", ChangeKind::Insert, "e1", Some(json!({"id": "e1"})));
    let err = tokio::time::timeout(WAIT, first)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SyncError::HandlerFailed { ref token, .. } if token == e1.as_str()));

    // Nobody leads while this one is published
    harness
        .source
        .publish("service", ChangeKind::Insert, "e2", Some(json!({"id": "e2"})));

    handler.set_failing(false);
    coordinator.start();
    let recovered = wait_until(WAIT, || {
        let handler = handler.clone();
        async move { handler.seen_ids() == ["e1", "e2"] }
    })
    .await;
    assert!(recovered, "seen: {:?}", handler.seen_ids());

    let e3 = harness
        .source
        .publish("service", ChangeKind::Insert, "e3", Some(json!({"id": "e3"})));
    let caught_up = wait_until(WAIT, || {
        let handler = handler.clone();
        async move { handler.seen_ids() == ["e1", "e2", "e3"] }
    })
    .await;
    assert!(caught_up, "seen: {:?}", handler.seen_ids());

    let checkpoint_reached = wait_until(WAIT, || {
        let state = state.clone();
        let e3 = e3.clone();
        async move {
            state
                .get_checkpoint("search", "service")
                .await
                .ok()
                .flatten()
                .is_some_and(|cp| cp.last_applied_token == e3)
        }
    })
    .await;
    assert!(checkpoint_reached);
    coordinator.stop().await;
}

#[tokio::test]
async fn test_duplicate_pipeline_names_are_rejected() {
    let harness = Harness::new();
    let components = harness.components(EntityRegistry::new());
    let first = components.pipeline("search");
    let second = components.pipeline("search");

    let err = components
        .with_pipeline(first)
        .unwrap()
        .with_pipeline(second)
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::DuplicateRegistration(_)));
}

#[tokio::test]
async fn test_stop_before_acquiring_ends_the_session() {
    let harness = Harness::new();
    // Another process holds the lock for the whole test
    let holder = searchsync_storage::LockRecord::new("search_sync", "other", chrono::Duration::seconds(60));
    harness
        .state
        .try_create_lock(&holder, chrono::Utc::now())
        .await
        .unwrap();

    let coordinator = Arc::new(SyncCoordinator::new(harness.components(EntityRegistry::new())).unwrap());
    let session = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_session().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.is_finished());

    coordinator.stop().await;
    let outcome = tokio::time::timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Stopped);
    assert_eq!(harness.lock_owner().await.as_deref(), Some("other"));
}
