//! Integration tests for leader election
//!
//! - Many contenders, one holder
//! - Leadership passes along as holders release
//! - SQLite-backed contention across connections

use searchsync_engine::{DistributedLock, LockHandle, LockLoss, LossCallback, PrimaryFlag, SyncConfig};
use searchsync_storage::{InMemorySyncStateStore, SyncStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

fn noop() -> LossCallback {
    Arc::new(|_| {})
}

fn lock(store: Arc<dyn SyncStateStore>) -> DistributedLock {
    DistributedLock::new(store, &SyncConfig::fast().lock)
}

async fn contend(stores: Vec<Arc<dyn SyncStateStore>>) -> Vec<LockHandle> {
    let mut attempts = JoinSet::new();
    for (i, store) in stores.into_iter().enumerate() {
        attempts.spawn(async move {
            lock(store)
                .try_acquire("search_sync", &format!("node-{i}"), noop())
                .await
                .unwrap()
        });
    }

    let mut holders = Vec::new();
    while let Some(joined) = attempts.join_next().await {
        if let Some(handle) = joined.unwrap() {
            holders.push(handle);
        }
    }
    holders
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_single_winner() {
    let store: Arc<dyn SyncStateStore> = Arc::new(InMemorySyncStateStore::new());
    let holders = contend((0..10).map(|_| store.clone()).collect()).await;

    assert_eq!(holders.len(), 1);
    let record = store.get_lock("search_sync").await.unwrap().unwrap();
    assert_eq!(record.owner_id, holders[0].owner_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_single_winner_on_sqlite() {
    use searchsync_storage::SqliteSyncStateStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync_state.db");
    let stores: Vec<Arc<dyn SyncStateStore>> = (0..6)
        .map(|_| Arc::new(SqliteSyncStateStore::new(&path).unwrap()) as Arc<dyn SyncStateStore>)
        .collect();
    let observer = stores[0].clone();

    let holders = contend(stores).await;
    assert_eq!(holders.len(), 1);
    let record = observer.get_lock("search_sync").await.unwrap().unwrap();
    assert_eq!(record.owner_id, holders[0].owner_id());
}

#[tokio::test]
async fn test_leadership_passes_along_on_release() {
    let store: Arc<dyn SyncStateStore> = Arc::new(InMemorySyncStateStore::new());

    let mut waiters = JoinSet::new();
    for owner in ["a", "b", "c"] {
        let store = store.clone();
        waiters.spawn(async move { lock(store).acquire("search_sync", owner, noop()).await });
    }

    let mut order = Vec::new();
    while let Ok(Some(joined)) =
        tokio::time::timeout(Duration::from_secs(5), waiters.join_next()).await
    {
        let handle = joined.unwrap().unwrap();
        order.push(handle.owner_id().to_string());
        // Hold briefly so the others observe a live record
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.stop().await.unwrap());
    }

    order.sort();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(store.get_lock("search_sync").await.unwrap().is_none());
}

#[tokio::test]
async fn test_demoted_holder_loses_and_standby_acquires() {
    let store: Arc<dyn SyncStateStore> = Arc::new(InMemorySyncStateStore::new());
    let flag = PrimaryFlag::new(true);
    let losses = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = losses.clone();
    let on_lost: LossCallback = Arc::new(move |reason| sink.lock().push(reason));

    let primary = lock(store.clone()).with_primary_status(Arc::new(flag.clone()));
    let held = primary
        .try_acquire("search_sync", "primary", on_lost)
        .await
        .unwrap()
        .unwrap();

    flag.set_primary(false);
    tokio::time::timeout(Duration::from_secs(2), held.lost_token().cancelled())
        .await
        .unwrap();
    assert_eq!(*losses.lock(), vec![LockLoss::Demoted]);

    // The record is left to expire, then the standby can take it
    let standby = lock(store.clone());
    let handle = tokio::time::timeout(
        Duration::from_secs(3),
        standby.acquire("search_sync", "standby", noop()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handle.owner_id(), "standby");
    assert!(!held.stop().await.unwrap());
    assert_eq!(
        store.get_lock("search_sync").await.unwrap().unwrap().owner_id,
        "standby"
    );
}
