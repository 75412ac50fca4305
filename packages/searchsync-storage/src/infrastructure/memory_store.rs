//! In-Memory Sync State Store
//!
//! HashMap-based implementation for unit tests and single-process hosts.
//! Lock creation is atomic within the process, which is all the tests need
//! to exercise contention between several owners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::models::{
    IndexVersionState, LockRecord, MigrationJob, ResumeToken, SyncCheckpoint,
};
use crate::domain::ports::SyncStateStore;
use crate::{Result, StorageError};

type CheckpointKey = (String, String);

#[derive(Clone, Default)]
pub struct InMemorySyncStateStore {
    locks: Arc<RwLock<HashMap<String, LockRecord>>>,
    jobs: Arc<RwLock<HashMap<String, MigrationJob>>>,
    index_states: Arc<RwLock<HashMap<String, IndexVersionState>>>,
    checkpoints: Arc<RwLock<HashMap<CheckpointKey, SyncCheckpoint>>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get_lock(&self, lock_name: &str) -> Result<Option<LockRecord>> {
        Ok(self.locks.read().get(lock_name).cloned())
    }

    async fn try_create_lock(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<bool> {
        let mut locks = self.locks.write();
        match locks.get(&record.lock_name) {
            Some(existing) if !existing.is_expired_at(now) => Ok(false),
            _ => {
                locks.insert(record.lock_name.clone(), record.clone());
                Ok(true)
            }
        }
    }

    async fn refresh_lock(
        &self,
        lock_name: &str,
        owner_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let mut locks = self.locks.write();
        match locks.get_mut(lock_name) {
            Some(record) if record.is_owned_by(owner_id) => {
                record.heartbeat_deadline = deadline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, lock_name: &str, owner_id: &str) -> Result<bool> {
        let mut locks = self.locks.write();
        if locks
            .get(lock_name)
            .is_some_and(|record| record.is_owned_by(owner_id))
        {
            locks.remove(lock_name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, record| !record.is_expired_at(now));
        Ok(before - locks.len())
    }

    async fn save_migration_job(&self, job: &MigrationJob) -> Result<()> {
        self.jobs
            .write()
            .insert(job.entity_type.clone(), job.clone());
        Ok(())
    }

    async fn get_migration_job(&self, entity_type: &str) -> Result<Option<MigrationJob>> {
        Ok(self.jobs.read().get(entity_type).cloned())
    }

    async fn list_migration_jobs(&self) -> Result<Vec<MigrationJob>> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(jobs)
    }

    async fn delete_migration_job(&self, entity_type: &str) -> Result<bool> {
        Ok(self.jobs.write().remove(entity_type).is_some())
    }

    async fn get_index_state(&self, entity_type: &str) -> Result<Option<IndexVersionState>> {
        Ok(self.index_states.read().get(entity_type).cloned())
    }

    async fn list_index_states(&self) -> Result<Vec<IndexVersionState>> {
        let mut states: Vec<_> = self.index_states.read().values().cloned().collect();
        states.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(states)
    }

    async fn save_index_state(&self, state: &IndexVersionState) -> Result<()> {
        self.index_states
            .write()
            .insert(state.entity_type.clone(), state.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        pipeline: &str,
        source_type: &str,
    ) -> Result<Option<SyncCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(&(pipeline.to_string(), source_type.to_string()))
            .cloned())
    }

    async fn list_checkpoints(&self, pipeline: &str) -> Result<Vec<SyncCheckpoint>> {
        let mut checkpoints: Vec<_> = self
            .checkpoints
            .read()
            .values()
            .filter(|cp| cp.pipeline == pipeline)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.source_type.cmp(&b.source_type));
        Ok(checkpoints)
    }

    async fn advance_checkpoint(
        &self,
        pipeline: &str,
        source_type: &str,
        token: &ResumeToken,
    ) -> Result<bool> {
        if pipeline.is_empty() || source_type.is_empty() {
            return Err(StorageError::config(
                "checkpoint key needs a pipeline and a source type",
            ));
        }
        let key = (pipeline.to_string(), source_type.to_string());
        let mut checkpoints = self.checkpoints.write();
        if let Some(existing) = checkpoints.get(&key) {
            if existing.last_applied_token > *token {
                return Ok(false);
            }
        }
        checkpoints.insert(
            key,
            SyncCheckpoint::new(pipeline, source_type, token.clone()),
        );
        Ok(true)
    }

    async fn delete_checkpoint(&self, pipeline: &str, source_type: &str) -> Result<bool> {
        Ok(self
            .checkpoints
            .write()
            .remove(&(pipeline.to_string(), source_type.to_string()))
            .is_some())
    }
}
