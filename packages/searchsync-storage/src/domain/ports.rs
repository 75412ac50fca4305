//! Storage Port (Trait Interface)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Development / single node: SQLite
//! - Testing: InMemory
//!
//! Only lock records are written by several processes at once; everything
//! else is written by the current leader alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{IndexVersionState, LockRecord, MigrationJob, ResumeToken, SyncCheckpoint};
use crate::Result;

/// Sync State Store Port (Primary Interface)
///
/// All storage backends must implement this trait
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Leader Lock
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Get the lock record, expired or not
    async fn get_lock(&self, lock_name: &str) -> Result<Option<LockRecord>>;

    /// Atomically create `record`.
    ///
    /// Succeeds (returns `true`) only if no record exists for the lock name or
    /// the existing one expired before `now`. Two concurrent callers can never
    /// both see `true`.
    async fn try_create_lock(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<bool>;

    /// Move the heartbeat deadline of a lock held by `owner_id`.
    ///
    /// Returns `false` if the record is gone or owned by someone else.
    async fn refresh_lock(
        &self,
        lock_name: &str,
        owner_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the lock if `owner_id` still holds it
    async fn delete_lock(&self, lock_name: &str, owner_id: &str) -> Result<bool>;

    /// Remove records whose deadline passed (TTL reclamation)
    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Migration Jobs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Save or replace the job for its entity type
    async fn save_migration_job(&self, job: &MigrationJob) -> Result<()>;

    async fn get_migration_job(&self, entity_type: &str) -> Result<Option<MigrationJob>>;

    async fn list_migration_jobs(&self) -> Result<Vec<MigrationJob>>;

    /// Returns `true` if a job was deleted
    async fn delete_migration_job(&self, entity_type: &str) -> Result<bool>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Index Version State
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn get_index_state(&self, entity_type: &str) -> Result<Option<IndexVersionState>>;

    async fn list_index_states(&self) -> Result<Vec<IndexVersionState>>;

    /// Save or replace (UPSERT)
    async fn save_index_state(&self, state: &IndexVersionState) -> Result<()>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Checkpoints
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn get_checkpoint(&self, pipeline: &str, source_type: &str)
        -> Result<Option<SyncCheckpoint>>;

    async fn list_checkpoints(&self, pipeline: &str) -> Result<Vec<SyncCheckpoint>>;

    /// Advance the checkpoint to `token`.
    ///
    /// Never moves backwards: if the stored token is already greater, nothing
    /// is written and `false` is returned. Re-saving the same token is allowed.
    async fn advance_checkpoint(
        &self,
        pipeline: &str,
        source_type: &str,
        token: &ResumeToken,
    ) -> Result<bool>;

    /// Drop the checkpoint, so the next session re-anchors at the feed's tail
    async fn delete_checkpoint(&self, pipeline: &str, source_type: &str) -> Result<bool>;
}
