//! Domain layer for the sync state store
//!
//! # Domain Models
//!
//! - `LockRecord`: leader lock with heartbeat deadline
//! - `MigrationJob`: durable ticket for an in-flight backfill
//! - `IndexVersionState`: live index + version per entity type
//! - `SyncCheckpoint`: last applied change per pipeline and source type
//!
//! # Port Trait
//!
//! - `SyncStateStore`: Primary storage abstraction

pub mod models;
pub mod ports;

pub use models::{IndexVersionState, LockRecord, MigrationJob, ResumeToken, SyncCheckpoint};
pub use ports::SyncStateStore;
