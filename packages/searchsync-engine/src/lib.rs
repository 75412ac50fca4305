/*
 * SearchSync Engine - search index synchronization
 *
 * Keeps query-optimized search indices consistent with a system of record
 * fed by a change-data-capture stream.
 *
 * Architecture:
 * - Leader lock (TTL + heartbeat) so one process syncs at a time
 * - Bulk sync: versioned rebuilds with atomic alias cutover
 * - Realtime sync: ordered fan-out to idempotent handlers, checkpointed
 * - Coordinator: lock → buffered listeners → backfill → realtime
 */

// Public modules
pub mod bulk;
pub mod change;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod executor;
pub mod index_store;
pub mod listener;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod realtime;
pub mod retry;
pub mod telemetry;

// Re-exports
pub use bulk::{BulkSyncEngine, BulkSyncReport, EntityOutcome, EntitySyncSummary};
pub use change::{ChangeEvent, ChangeKind, ChangeSource, ChangeStream, InMemoryChangeSource};
pub use config::{
    BulkConfig, ConfigError, CoordinatorConfig, FailStopPolicy, LockConfig, RealtimeConfig,
    RetryConfig, SyncConfig,
};
pub use coordinator::{SessionOutcome, SyncComponents, SyncCoordinator};
pub use entity::{
    identity_view, EntityRegistry, EntityView, InMemoryRecordSource, Record, RecordSource,
    RecordStream, SearchEntity,
};
pub use error::{ErrorCategory, IndexError, Result, SyncError};
pub use executor::BoundedExecutor;
pub use index_store::{
    AliasAction, Document, DocumentQuery, FieldKind, InMemoryIndexStore, IndexSchema, IndexStore,
    ListMutation, MutationOutcome, MutationReport, RetryingIndexStore,
};
#[cfg(feature = "tantivy")]
pub use index_store::TantivyIndexStore;
pub use listener::{ChangeListener, ListenerHandle};
pub use lock::{
    AlwaysPrimary, DistributedLock, LockHandle, LockLoss, LossCallback, PrimaryFlag, PrimaryStatus,
};
pub use metrics::{EntityMetrics, SyncMetricsTracker};
#[cfg(feature = "metrics")]
pub use metrics::PrometheusSyncMetrics;
pub use migration::{MigrationState, MigrationStateMachine};
pub use realtime::{
    ChangeHandler, DenormalizedFieldHandler, EntityViewHandler, ListProjectionHandler,
    RealtimeReport, RealtimeSyncEngine,
};
pub use retry::{retry_async, RetryPolicy, Retryable};

pub use searchsync_storage::{ResumeToken, SyncStateStore};
