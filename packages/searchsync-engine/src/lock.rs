//! Leader election via a TTL + heartbeat lock record
//!
//! ```text
//! acquire ──► live record? ──yes──► sleep(acquire_backoff) ──┐
//!    ▲            │ no                                        │
//!    │            ▼                                           │
//!    │      atomic create ──lost race──────────────────────────┤
//!    │            │ created                                   │
//!    │            ▼                                           │
//!    │   sleep(readiness_window), re-read owner ──mismatch────┘
//!    │            │ verified
//!    │            ▼
//!    │      spawn heartbeat (every heartbeat_interval, deadline = now + ttl)
//! ```
//!
//! The heartbeat is the only thing that notices a lost lock. On loss it
//! trips the handle's `lost` token and calls the loss callback once, which
//! is what shuts the sync engines down. Crash recovery needs no unlock: an
//! abandoned record simply expires.

use chrono::{DateTime, Utc};
use searchsync_storage::{LockRecord, SyncStateStore};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LockConfig;
use crate::error::Result;

/// Source of primary/standby status (e.g. an active-active failover
/// controller). Only a primary may hold the lock.
pub trait PrimaryStatus: Send + Sync {
    fn is_primary(&self) -> bool;
}

/// Single-site deployments: always primary
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPrimary;

impl PrimaryStatus for AlwaysPrimary {
    fn is_primary(&self) -> bool {
        true
    }
}

/// Externally toggled status
#[derive(Debug, Clone)]
pub struct PrimaryFlag(Arc<AtomicBool>);

impl PrimaryFlag {
    pub fn new(primary: bool) -> Self {
        Self(Arc::new(AtomicBool::new(primary)))
    }

    pub fn set_primary(&self, primary: bool) {
        self.0.store(primary, Ordering::SeqCst);
    }
}

impl PrimaryStatus for PrimaryFlag {
    fn is_primary(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a held lock was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLoss {
    /// The record disappeared
    RecordMissing,
    /// Another owner holds the record
    OwnerMismatch,
    /// This process is no longer primary
    Demoted,
    /// Heartbeats kept failing until the deadline passed
    Expired,
}

impl fmt::Display for LockLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockLoss::RecordMissing => "record missing",
            LockLoss::OwnerMismatch => "owner mismatch",
            LockLoss::Demoted => "demoted from primary",
            LockLoss::Expired => "heartbeat deadline passed",
        };
        f.write_str(s)
    }
}

/// Called from the heartbeat task, at most once per handle
pub type LossCallback = Arc<dyn Fn(LockLoss) + Send + Sync>;

pub struct DistributedLock {
    store: Arc<dyn SyncStateStore>,
    primary: Arc<dyn PrimaryStatus>,
    ttl: Duration,
    heartbeat_interval: Duration,
    acquire_backoff: Duration,
    readiness_window: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn SyncStateStore>, config: &LockConfig) -> Self {
        Self {
            store,
            primary: Arc::new(AlwaysPrimary),
            ttl: config.ttl(),
            heartbeat_interval: config.heartbeat_interval(),
            acquire_backoff: config.acquire_backoff(),
            readiness_window: config.readiness_window(),
        }
    }

    pub fn with_primary_status(mut self, primary: Arc<dyn PrimaryStatus>) -> Self {
        self.primary = primary;
        self
    }

    fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Block until the lock is held.
    ///
    /// Dropping the returned future mid-attempt is safe: a record created but
    /// not yet heartbeating expires after one TTL.
    pub async fn acquire(
        &self,
        lock_name: &str,
        owner_id: &str,
        on_lost: LossCallback,
    ) -> Result<LockHandle> {
        loop {
            if let Some(handle) = self.try_acquire(lock_name, owner_id, on_lost.clone()).await? {
                return Ok(handle);
            }
            tokio::time::sleep(self.acquire_backoff).await;
        }
    }

    /// One acquisition attempt. `None` if someone else holds the lock or the
    /// race for it was lost.
    pub async fn try_acquire(
        &self,
        lock_name: &str,
        owner_id: &str,
        on_lost: LossCallback,
    ) -> Result<Option<LockHandle>> {
        if !self.primary.is_primary() {
            debug!(lock = lock_name, owner_id, "Not primary, skipping lock attempt");
            return Ok(None);
        }

        let now = Utc::now();
        self.store.purge_expired_locks(now).await?;
        if let Some(existing) = self.store.get_lock(lock_name).await? {
            if !existing.is_expired_at(now) {
                debug!(
                    lock = lock_name,
                    holder = %existing.owner_id,
                    deadline = %existing.heartbeat_deadline,
                    "Lock held elsewhere"
                );
                return Ok(None);
            }
        }

        let record = LockRecord::new(lock_name, owner_id, self.chrono_ttl());
        if !self.store.try_create_lock(&record, now).await? {
            debug!(lock = lock_name, owner_id, "Lost race creating lock record");
            return Ok(None);
        }

        // A competing writer may have raced the same gap; only trust the
        // record after it settles
        tokio::time::sleep(self.readiness_window).await;
        let deadline = match self.store.get_lock(lock_name).await? {
            Some(current) if current.is_owned_by(owner_id) => current.heartbeat_deadline,
            other => {
                warn!(
                    lock = lock_name,
                    owner_id,
                    holder = ?other.map(|r| r.owner_id),
                    "Ownership not confirmed after readiness window"
                );
                return Ok(None);
            }
        };

        info!(lock = lock_name, owner_id, "Acquired sync lock");
        Ok(Some(self.spawn_heartbeat(lock_name, owner_id, deadline, on_lost)))
    }

    fn spawn_heartbeat(
        &self,
        lock_name: &str,
        owner_id: &str,
        deadline: DateTime<Utc>,
        on_lost: LossCallback,
    ) -> LockHandle {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let heartbeat = Heartbeat {
            store: self.store.clone(),
            primary: self.primary.clone(),
            lock_name: lock_name.to_string(),
            owner_id: owner_id.to_string(),
            ttl: self.chrono_ttl(),
            interval: self.heartbeat_interval,
            stop: stop.clone(),
            lost: lost.clone(),
            on_lost,
        };
        let task = tokio::spawn(heartbeat.run(deadline));

        LockHandle {
            store: self.store.clone(),
            lock_name: lock_name.to_string(),
            owner_id: owner_id.to_string(),
            stop,
            lost,
            task: Some(task),
        }
    }
}

struct Heartbeat {
    store: Arc<dyn SyncStateStore>,
    primary: Arc<dyn PrimaryStatus>,
    lock_name: String,
    owner_id: String,
    ttl: chrono::Duration,
    interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
    on_lost: LossCallback,
}

impl Heartbeat {
    async fn run(self, mut deadline: DateTime<Utc>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !self.primary.is_primary() {
                self.lose(LockLoss::Demoted);
                return;
            }

            let next = Utc::now() + self.ttl;
            match self
                .store
                .refresh_lock(&self.lock_name, &self.owner_id, next)
                .await
            {
                Ok(true) => {
                    deadline = next;
                    debug!(lock = %self.lock_name, deadline = %deadline, "Heartbeat");
                }
                Ok(false) => {
                    let reason = match self.store.get_lock(&self.lock_name).await {
                        Ok(Some(_)) => LockLoss::OwnerMismatch,
                        _ => LockLoss::RecordMissing,
                    };
                    self.lose(reason);
                    return;
                }
                Err(e) => {
                    warn!(lock = %self.lock_name, error = %e, "Heartbeat failed");
                    if Utc::now() >= deadline {
                        self.lose(LockLoss::Expired);
                        return;
                    }
                }
            }
        }
    }

    fn lose(&self, reason: LockLoss) {
        if self.stop.is_cancelled() {
            return;
        }
        error!(
            lock = %self.lock_name,
            owner_id = %self.owner_id,
            reason = %reason,
            "Sync lock lost"
        );
        self.lost.cancel();
        (self.on_lost)(reason);
    }
}

/// A held lock. Stopping it releases the record; dropping it only stops the
/// heartbeat and leaves the record to expire.
pub struct LockHandle {
    store: Arc<dyn SyncStateStore>,
    lock_name: String,
    owner_id: String,
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Cancelled once the heartbeat observes the loss
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop the heartbeat and delete the record if still ours.
    ///
    /// Returns `true` if a record was deleted.
    pub async fn stop(mut self) -> Result<bool> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(lock = %self.lock_name, error = %e, "Heartbeat task ended abnormally");
            }
        }
        if self.lost.is_cancelled() {
            return Ok(false);
        }
        let deleted = self
            .store
            .delete_lock(&self.lock_name, &self.owner_id)
            .await?;
        info!(lock = %self.lock_name, owner_id = %self.owner_id, deleted, "Released sync lock");
        Ok(deleted)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_name", &self.lock_name)
            .field("owner_id", &self.owner_id)
            .field("lost", &self.lost.is_cancelled())
            .finish()
    }
}
