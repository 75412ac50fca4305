//! SyncStateStore - durable state of the search sync engine
//!
//! Four record types survive process restarts:
//!
//! 1. **LockRecord**: leader election, TTL + heartbeat, atomic create
//! 2. **MigrationJob**: marker for an in-flight backfill (crash recovery)
//! 3. **IndexVersionState**: live index and schema version per entity type
//! 4. **SyncCheckpoint**: resume position per pipeline and source type
//!
//! ## Usage
//!
//! ```rust,ignore
//! use searchsync_storage::{InMemorySyncStateStore, ResumeToken, SyncStateStore};
//!
//! let store = InMemorySyncStateStore::new();
//! store.advance_checkpoint("search", "service", &ResumeToken::from_sequence(42)).await?;
//! let cp = store.get_checkpoint("search", "service").await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    IndexVersionState, LockRecord, MigrationJob, ResumeToken, SyncCheckpoint, SyncStateStore,
};

pub use infrastructure::InMemorySyncStateStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteSyncStateStore;
