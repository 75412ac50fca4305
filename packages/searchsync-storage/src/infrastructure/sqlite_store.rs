//! SQLite Sync State Store
//!
//! File-based persistent storage using SQLite. Several processes on one host
//! can share the file; lock creation and checkpoint advancement are single
//! conditional UPSERT statements, so SQLite's write lock makes them atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::models::{
    IndexVersionState, LockRecord, MigrationJob, ResumeToken, SyncCheckpoint,
};
use crate::domain::ports::SyncStateStore;
use crate::{Result, StorageError};

/// SQLite-based SyncStateStore implementation
#[derive(Clone)]
pub struct SqliteSyncStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSyncStateStore {
    /// Create a new SQLite store at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_locks (
                lock_name TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                heartbeat_deadline INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_locks_deadline
                ON sync_locks(heartbeat_deadline);

            CREATE TABLE IF NOT EXISTS migration_jobs (
                entity_type TEXT PRIMARY KEY,
                new_index_name TEXT NOT NULL,
                old_index_name TEXT,
                from_version INTEGER,
                to_version INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_version_states (
                entity_type TEXT PRIMARY KEY,
                sync_version INTEGER NOT NULL,
                live_index_name TEXT,
                force_rebuild BOOLEAN NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                pipeline TEXT NOT NULL,
                source_type TEXT NOT NULL,
                last_applied_token TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (pipeline, source_type)
            );",
        )?;

        Ok(())
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<LockRecord> {
    Ok(LockRecord {
        lock_name: row.get(0)?,
        owner_id: row.get(1)?,
        heartbeat_deadline: from_millis(row.get(2)?),
        created_at: from_millis(row.get(3)?),
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationJob> {
    Ok(MigrationJob {
        entity_type: row.get(0)?,
        new_index_name: row.get(1)?,
        old_index_name: row.get(2)?,
        from_version: row.get(3)?,
        to_version: row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

fn index_state_from_row(row: &Row<'_>) -> rusqlite::Result<IndexVersionState> {
    Ok(IndexVersionState {
        entity_type: row.get(0)?,
        sync_version: row.get(1)?,
        live_index_name: row.get(2)?,
        force_rebuild: row.get(3)?,
        updated_at: from_millis(row.get(4)?),
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<SyncCheckpoint> {
    Ok(SyncCheckpoint {
        pipeline: row.get(0)?,
        source_type: row.get(1)?,
        last_applied_token: ResumeToken(row.get(2)?),
        updated_at: from_millis(row.get(3)?),
    })
}

const LOCK_COLUMNS: &str = "lock_name, owner_id, heartbeat_deadline, created_at";
const JOB_COLUMNS: &str =
    "entity_type, new_index_name, old_index_name, from_version, to_version, created_at";
const INDEX_STATE_COLUMNS: &str =
    "entity_type, sync_version, live_index_name, force_rebuild, updated_at";
const CHECKPOINT_COLUMNS: &str = "pipeline, source_type, last_applied_token, updated_at";

#[async_trait]
impl SyncStateStore for SqliteSyncStateStore {
    async fn get_lock(&self, lock_name: &str) -> Result<Option<LockRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {LOCK_COLUMNS} FROM sync_locks WHERE lock_name = ?1"),
                params![lock_name],
                lock_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn try_create_lock(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        // Insert, or take over a record whose deadline already passed
        let changed = conn.execute(
            "INSERT INTO sync_locks (lock_name, owner_id, heartbeat_deadline, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_name) DO UPDATE SET
                owner_id = excluded.owner_id,
                heartbeat_deadline = excluded.heartbeat_deadline,
                created_at = excluded.created_at
             WHERE sync_locks.heartbeat_deadline <= ?5",
            params![
                &record.lock_name,
                &record.owner_id,
                millis(record.heartbeat_deadline),
                millis(record.created_at),
                millis(now),
            ],
        )?;
        Ok(changed == 1)
    }

    async fn refresh_lock(
        &self,
        lock_name: &str,
        owner_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sync_locks SET heartbeat_deadline = ?3
             WHERE lock_name = ?1 AND owner_id = ?2",
            params![lock_name, owner_id, millis(deadline)],
        )?;
        Ok(changed == 1)
    }

    async fn delete_lock(&self, lock_name: &str, owner_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM sync_locks WHERE lock_name = ?1 AND owner_id = ?2",
            params![lock_name, owner_id],
        )?;
        Ok(changed == 1)
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let purged = conn.execute(
            "DELETE FROM sync_locks WHERE heartbeat_deadline <= ?1",
            params![millis(now)],
        )?;
        Ok(purged)
    }

    async fn save_migration_job(&self, job: &MigrationJob) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT OR REPLACE INTO migration_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                &job.entity_type,
                &job.new_index_name,
                &job.old_index_name,
                job.from_version,
                job.to_version,
                millis(job.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_migration_job(&self, entity_type: &str) -> Result<Option<MigrationJob>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM migration_jobs WHERE entity_type = ?1"),
                params![entity_type],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn list_migration_jobs(&self) -> Result<Vec<MigrationJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM migration_jobs ORDER BY entity_type"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    async fn delete_migration_job(&self, entity_type: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM migration_jobs WHERE entity_type = ?1",
            params![entity_type],
        )?;
        Ok(changed == 1)
    }

    async fn get_index_state(&self, entity_type: &str) -> Result<Option<IndexVersionState>> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                &format!(
                    "SELECT {INDEX_STATE_COLUMNS} FROM index_version_states WHERE entity_type = ?1"
                ),
                params![entity_type],
                index_state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    async fn list_index_states(&self) -> Result<Vec<IndexVersionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INDEX_STATE_COLUMNS} FROM index_version_states ORDER BY entity_type"
        ))?;
        let states = stmt
            .query_map([], index_state_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    async fn save_index_state(&self, state: &IndexVersionState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO index_version_states ({INDEX_STATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                &state.entity_type,
                state.sync_version,
                &state.live_index_name,
                state.force_rebuild,
                millis(state.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        pipeline: &str,
        source_type: &str,
    ) -> Result<Option<SyncCheckpoint>> {
        let conn = self.conn.lock();
        let checkpoint = conn
            .query_row(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints
                     WHERE pipeline = ?1 AND source_type = ?2"
                ),
                params![pipeline, source_type],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, pipeline: &str) -> Result<Vec<SyncCheckpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints
             WHERE pipeline = ?1 ORDER BY source_type"
        ))?;
        let checkpoints = stmt
            .query_map(params![pipeline], checkpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
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
        let conn = self.conn.lock();
        // BINARY collation compares bytes, matching ResumeToken's Ord
        let changed = conn.execute(
            "INSERT INTO sync_checkpoints (pipeline, source_type, last_applied_token, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(pipeline, source_type) DO UPDATE SET
                last_applied_token = excluded.last_applied_token,
                updated_at = excluded.updated_at
             WHERE sync_checkpoints.last_applied_token <= excluded.last_applied_token",
            params![pipeline, source_type, token.as_str(), millis(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    async fn delete_checkpoint(&self, pipeline: &str, source_type: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM sync_checkpoints WHERE pipeline = ?1 AND source_type = ?2",
            params![pipeline, source_type],
        )?;
        Ok(changed == 1)
    }
}
