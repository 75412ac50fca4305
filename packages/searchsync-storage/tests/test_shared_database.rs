//! Several processes sharing one SQLite file
//!
//! Each store below owns its own connection, the same as separate processes
//! pointing at one database file.

#![cfg(feature = "sqlite")]

use chrono::{Duration, Utc};
use searchsync_storage::{
    InMemorySyncStateStore, LockRecord, ResumeToken, SqliteSyncStateStore, SyncStateStore,
};
use std::sync::Arc;
use tokio::task::JoinSet;

fn open_many(path: &std::path::Path, count: usize) -> Vec<SqliteSyncStateStore> {
    (0..count)
        .map(|_| SqliteSyncStateStore::new(path).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_connection_creates_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let stores = open_many(&dir.path().join("sync_state.db"), 8);

    let now = Utc::now();
    let mut tasks = JoinSet::new();
    for (i, store) in stores.iter().cloned().enumerate() {
        tasks.spawn(async move {
            let record = LockRecord::new("sync", format!("owner-{i}"), Duration::seconds(30));
            let created = store.try_create_lock(&record, now).await.unwrap();
            (record.owner_id, created)
        });
    }

    let mut winners = Vec::new();
    while let Some(result) = tasks.join_next().await {
        let (owner, created) = result.unwrap();
        if created {
            winners.push(owner);
        }
    }

    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    for store in &stores {
        let record = store.get_lock("sync").await.unwrap().unwrap();
        assert_eq!(record.owner_id, winners[0]);
    }
}

#[tokio::test]
async fn test_expired_lock_taken_over_through_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let stores = open_many(&dir.path().join("sync_state.db"), 2);

    let stale = LockRecord::new("sync", "crashed", Duration::milliseconds(-1));
    assert!(stores[0].try_create_lock(&stale, Utc::now()).await.unwrap());

    let fresh = LockRecord::new("sync", "standby", Duration::seconds(30));
    assert!(stores[1].try_create_lock(&fresh, Utc::now()).await.unwrap());

    // The crashed owner can neither refresh nor release the record
    let later = Utc::now() + Duration::seconds(30);
    assert!(!stores[0].refresh_lock("sync", "crashed", later).await.unwrap());
    assert!(!stores[0].delete_lock("sync", "crashed").await.unwrap());
    assert_eq!(
        stores[0].get_lock("sync").await.unwrap().unwrap().owner_id,
        "standby"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoint_never_moves_backwards_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let stores = open_many(&dir.path().join("sync_state.db"), 4);

    let mut tasks = JoinSet::new();
    for (i, store) in stores.iter().cloned().enumerate() {
        tasks.spawn(async move {
            // Interleaved and out of order on purpose
            for seq in (0..50u64).rev().chain(0..50u64) {
                let token = ResumeToken::from_sequence(seq * 4 + i as u64);
                store
                    .advance_checkpoint("search", "service", &token)
                    .await
                    .unwrap();
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let checkpoint = stores[0]
        .get_checkpoint("search", "service")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_applied_token, ResumeToken::from_sequence(49 * 4 + 3));
}

#[tokio::test]
async fn test_in_memory_store_matches_sqlite_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteSyncStateStore::new(dir.path().join("sync_state.db")).unwrap();
    let stores: Vec<Arc<dyn SyncStateStore>> =
        vec![Arc::new(InMemorySyncStateStore::new()), Arc::new(sqlite)];

    for store in stores {
        let now = Utc::now();
        let a = LockRecord::new("sync", "a", Duration::seconds(10));
        let b = LockRecord::new("sync", "b", Duration::seconds(10));
        assert!(store.try_create_lock(&a, now).await.unwrap());
        assert!(!store.try_create_lock(&b, now).await.unwrap());
        assert_eq!(store.purge_expired_locks(now).await.unwrap(), 0);
        assert_eq!(
            store
                .purge_expired_locks(now + Duration::seconds(11))
                .await
                .unwrap(),
            1
        );
        assert!(store.get_lock("sync").await.unwrap().is_none());

        let t5 = ResumeToken::from_sequence(5);
        assert!(store.advance_checkpoint("p", "s", &t5).await.unwrap());
        assert!(store.advance_checkpoint("p", "s", &t5).await.unwrap());
        assert!(!store
            .advance_checkpoint("p", "s", &ResumeToken::from_sequence(4))
            .await
            .unwrap());
        assert!(store.advance_checkpoint("", "s", &t5).await.is_err());
        assert!(store.delete_checkpoint("p", "s").await.unwrap());
        assert!(store.get_checkpoint("p", "s").await.unwrap().is_none());
    }
}
