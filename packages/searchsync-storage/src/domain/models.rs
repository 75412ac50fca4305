//! Persisted sync state records
//!
//! Each record is keyed by a stable identifier:
//!
//! | record | key |
//! |--------|-----|
//! | `LockRecord` | lock name |
//! | `MigrationJob` | entity type |
//! | `IndexVersionState` | entity type |
//! | `SyncCheckpoint` | (pipeline, source type) |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque change-feed position.
///
/// Change sources hand out tokens that increase strictly per source type, so
/// the derived ordering is the commit ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fixed-width hex encoding of a sequence number, so lexical order
    /// matches numeric order.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("{:016x}", sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Leader lock record.
///
/// At most one non-expired record exists per `lock_name`. Holding the lock is
/// proven by `owner_id`, not by the record merely existing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_name: String,
    pub owner_id: String,
    pub heartbeat_deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(lock_name: impl Into<String>, owner_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_name: lock_name.into(),
            owner_id: owner_id.into(),
            heartbeat_deadline: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_deadline <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}

/// Durable work ticket for one backfill.
///
/// Created before the backfill writes anything and deleted only after the
/// cutover succeeded. Finding one at startup means a backfill was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub entity_type: String,
    pub new_index_name: String,
    pub old_index_name: Option<String>,
    pub from_version: Option<u32>,
    pub to_version: u32,
    pub created_at: DateTime<Utc>,
}

impl MigrationJob {
    pub fn new(
        entity_type: impl Into<String>,
        new_index_name: impl Into<String>,
        to_version: u32,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            new_index_name: new_index_name.into(),
            old_index_name: None,
            from_version: None,
            to_version,
            created_at: Utc::now(),
        }
    }

    /// Record the index currently serving reads and the version it carries.
    pub fn replacing(mut self, old_index_name: Option<String>, from_version: Option<u32>) -> Self {
        self.old_index_name = old_index_name;
        self.from_version = from_version;
        self
    }
}

/// Which index serves reads for an entity type, and at what version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexVersionState {
    pub entity_type: String,
    pub sync_version: u32,
    pub live_index_name: Option<String>,
    #[serde(default)]
    pub force_rebuild: bool,
    pub updated_at: DateTime<Utc>,
}

impl IndexVersionState {
    pub fn new(
        entity_type: impl Into<String>,
        sync_version: u32,
        live_index_name: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            sync_version,
            live_index_name: Some(live_index_name.into()),
            force_rebuild: false,
            updated_at: Utc::now(),
        }
    }

    /// True when the code expects another version or a rebuild was forced.
    pub fn needs_rebuild(&self, expected_version: u32) -> bool {
        self.force_rebuild
            || self.sync_version != expected_version
            || self.live_index_name.is_none()
    }
}

/// Last change applied by every handler of a pipeline for one source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub pipeline: String,
    pub source_type: String,
    pub last_applied_token: ResumeToken,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(
        pipeline: impl Into<String>,
        source_type: impl Into<String>,
        last_applied_token: ResumeToken,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            source_type: source_type.into(),
            last_applied_token,
            updated_at: Utc::now(),
        }
    }
}
