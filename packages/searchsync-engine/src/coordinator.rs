//! Sync coordinator
//!
//! Runs the sync lifecycle on the process that holds the leader lock:
//!
//! ```text
//! acquire lock
//!   └─► start listeners (buffering, resumed from checkpoints)
//!         └─► bulk sync
//!               └─► release buffers
//!                     └─► realtime engines
//!                           └─► until lock lost / stop / halt
//! shutdown tasks ─► release lock
//! ```
//!
//! A session that ends for any reason other than `stop` is retried after
//! `coordinator.restart_backoff`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use searchsync_storage::SyncStateStore;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bulk::BulkSyncEngine;
use crate::change::ChangeSource;
use crate::config::{FailStopPolicy, SyncConfig};
use crate::entity::EntityRegistry;
use crate::error::{Result, SyncError};
use crate::index_store::{IndexStore, RetryingIndexStore};
use crate::listener::{ChangeListener, ListenerHandle};
use crate::lock::{AlwaysPrimary, DistributedLock, LossCallback, PrimaryStatus};
use crate::metrics::SyncMetricsTracker;
use crate::realtime::{ChangeHandler, EntityViewHandler, RealtimeSyncEngine};
use crate::retry::RetryPolicy;

/// Everything the coordinator runs, wired explicitly by the host.
pub struct SyncComponents {
    config: SyncConfig,
    state: Arc<dyn SyncStateStore>,
    index: Arc<dyn IndexStore>,
    registry: Arc<EntityRegistry>,
    change_source: Arc<dyn ChangeSource>,
    pipelines: Vec<Arc<RealtimeSyncEngine>>,
    metrics: SyncMetricsTracker,
    primary: Arc<dyn PrimaryStatus>,
}

impl SyncComponents {
    /// `index` is wrapped so transient backend errors are retried per
    /// `config.retry`.
    pub fn new(
        config: SyncConfig,
        state: Arc<dyn SyncStateStore>,
        index: Arc<dyn IndexStore>,
        registry: EntityRegistry,
        change_source: Arc<dyn ChangeSource>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            config,
            state,
            index: Arc::new(RetryingIndexStore::new(index, retry)),
            registry: Arc::new(registry),
            change_source,
            pipelines: Vec::new(),
            metrics: SyncMetricsTracker::new(),
            primary: Arc::new(AlwaysPrimary),
        }
    }

    pub fn with_metrics(mut self, metrics: SyncMetricsTracker) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_primary_status(mut self, primary: Arc<dyn PrimaryStatus>) -> Self {
        self.primary = primary;
        self
    }

    /// Add a pipeline. Names must be unique, they key the checkpoints.
    pub fn with_pipeline(mut self, engine: RealtimeSyncEngine) -> Result<Self> {
        if self.pipelines.iter().any(|p| p.pipeline() == engine.pipeline()) {
            return Err(SyncError::DuplicateRegistration(format!(
                "pipeline '{}'",
                engine.pipeline()
            )));
        }
        self.pipelines.push(Arc::new(engine));
        Ok(self)
    }

    /// Empty pipeline sharing this wiring's state store, metrics and retry
    /// policy
    pub fn pipeline(&self, name: &str) -> RealtimeSyncEngine {
        RealtimeSyncEngine::new(name, self.state.clone(), self.metrics.clone())
            .with_retry(RetryPolicy::from(&self.config.retry))
    }

    /// One view handler per registered entity type
    pub fn entity_view_handlers(&self) -> Vec<Arc<dyn ChangeHandler>> {
        self.registry
            .iter()
            .map(|entity| {
                Arc::new(EntityViewHandler::new(entity.clone(), self.index.clone()))
                    as Arc<dyn ChangeHandler>
            })
            .collect()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<dyn SyncStateStore> {
        &self.state
    }

    /// The retrying index store handed to the engines
    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &SyncMetricsTracker {
        &self.metrics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// `stop` was called
    Stopped,
    /// Another process took the lock, or this one was demoted
    LockLost,
    /// Every change stream ended
    Drained,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionOutcome::Stopped => "stopped",
            SessionOutcome::LockLost => "lock_lost",
            SessionOutcome::Drained => "drained",
        };
        f.write_str(s)
    }
}

pub struct SyncCoordinator {
    components: SyncComponents,
    owner_id: String,
    lock: DistributedLock,
    bulk: BulkSyncEngine,
    stop: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    sessions: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(components: SyncComponents) -> Result<Self> {
        components.config.validate()?;
        let config = &components.config;

        let owner_id = config
            .coordinator
            .owner_id
            .clone()
            .unwrap_or_else(|| format!("searchsync-{}", Uuid::new_v4()));
        let lock = DistributedLock::new(components.state.clone(), &config.lock)
            .with_primary_status(components.primary.clone());
        // The index store already retries
        let bulk = BulkSyncEngine::new(
            components.registry.clone(),
            components.index.clone(),
            components.state.clone(),
            components.metrics.clone(),
            config.bulk.max_in_flight,
        )
        .with_retry(RetryPolicy::none());

        Ok(Self {
            components,
            owner_id,
            lock,
            bulk,
            stop: CancellationToken::new(),
            supervisor: Mutex::new(None),
            sessions: AtomicU64::new(0),
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn components(&self) -> &SyncComponents {
        &self.components
    }

    /// Sessions started so far
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawn the supervisor loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { this.supervise().await }));
        info!(owner_id = %self.owner_id, "Sync coordinator started");
    }

    /// Cancel the running session, release the lock and wait for the
    /// supervisor to exit.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(owner_id = %self.owner_id, error = %e, "Supervisor ended abnormally");
            }
        }
        info!(owner_id = %self.owner_id, "Sync coordinator stopped");
    }

    async fn supervise(&self) {
        let backoff = self.components.config.coordinator.restart_backoff();
        while !self.stop.is_cancelled() {
            match self.run_session().await {
                Ok(SessionOutcome::Stopped) => break,
                Ok(outcome) => {
                    info!(owner_id = %self.owner_id, %outcome, "Sync session ended")
                }
                Err(e) => error!(
                    owner_id = %self.owner_id,
                    error = %e,
                    category = %e.category(),
                    "Sync session failed"
                ),
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One leadership session: blocks until the lock is acquired, then runs
    /// until the lock is lost, `stop` is called, or a pipeline halts.
    pub async fn run_session(&self) -> Result<SessionOutcome> {
        let session_no = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let lock_name = self.components.config.lock.lock_name.as_str();

        let owner = self.owner_id.clone();
        let on_lost: LossCallback = Arc::new(move |loss| {
            warn!(owner_id = %owner, reason = %loss, "Leadership lost, stopping sync")
        });

        let handle = tokio::select! {
            _ = self.stop.cancelled() => return Ok(SessionOutcome::Stopped),
            acquired = self.lock.acquire(lock_name, &self.owner_id, on_lost) => acquired?,
        };
        info!(
            owner_id = %self.owner_id,
            lock = lock_name,
            session = session_no,
            "Leadership acquired"
        );

        let session = self.stop.child_token();
        let outcome = self.lead(&handle.lost_token(), &session).await;
        session.cancel();

        if let Err(e) = handle.stop().await {
            warn!(owner_id = %self.owner_id, error = %e, "Failed to release sync lock");
        }
        outcome
    }

    async fn lead(
        &self,
        lost: &CancellationToken,
        session: &CancellationToken,
    ) -> Result<SessionOutcome> {
        let mut listeners = Vec::new();
        let outcome = self.drive(lost, session, &mut listeners).await;
        session.cancel();

        let mut listener_error = None;
        for listener in listeners {
            let pipeline = listener.pipeline().to_string();
            if let Err(e) = listener.join().await {
                warn!(pipeline = %pipeline, error = %e, "Change listener ended with an error");
                listener_error.get_or_insert(e);
            }
        }

        match (outcome, listener_error) {
            (Ok(SessionOutcome::Drained), Some(e)) => Err(e),
            (outcome, _) => outcome,
        }
    }

    async fn drive(
        &self,
        lost: &CancellationToken,
        session: &CancellationToken,
        listeners: &mut Vec<ListenerHandle>,
    ) -> Result<SessionOutcome> {
        let config = &self.components.config;

        let mut receivers = Vec::with_capacity(self.components.pipelines.len());
        for engine in &self.components.pipelines {
            let resume_tokens = engine
                .anchored_resume_tokens(self.components.change_source.as_ref())
                .await?;
            let listener = ChangeListener::new(
                engine.pipeline(),
                self.components.change_source.clone(),
                engine.source_types(),
                config.realtime.queue_capacity,
            );
            let (handle, rx) = listener
                .start(&resume_tokens, true, session.child_token())
                .await?;
            listeners.push(handle);
            receivers.push((engine.clone(), rx));
        }

        let report = tokio::select! {
            _ = lost.cancelled() => return Ok(SessionOutcome::LockLost),
            _ = session.cancelled() => return Ok(SessionOutcome::Stopped),
            report = self.bulk.run() => report?,
        };
        debug!(
            migrated = ?report.migrated(),
            documents = report.documents_indexed(),
            "Backfill phase done"
        );

        for listener in listeners.iter() {
            listener.release();
        }

        let policy = config.realtime.fail_stop;
        let shared_halt = CancellationToken::new();
        let mut pipelines = JoinSet::new();
        for (engine, rx) in receivers {
            let halt = match policy {
                FailStopPolicy::Shared => shared_halt.clone(),
                FailStopPolicy::Independent => CancellationToken::new(),
            };
            let shutdown = session.child_token();
            pipelines.spawn(async move { engine.run(rx, shutdown, halt).await });
        }

        let watching = !pipelines.is_empty();
        let mut outcome = SessionOutcome::Drained;
        let mut errors: Vec<SyncError> = Vec::new();
        loop {
            tokio::select! {
                _ = lost.cancelled() => {
                    outcome = SessionOutcome::LockLost;
                    break;
                }
                _ = session.cancelled() => {
                    outcome = SessionOutcome::Stopped;
                    break;
                }
                joined = pipelines.join_next(), if watching => match joined {
                    None => break,
                    Some(Ok(Ok(report))) => {
                        debug!(
                            pipeline = %report.pipeline,
                            events = report.events_applied,
                            "Pipeline finished"
                        );
                    }
                    Some(Ok(Err(e))) => {
                        errors.push(e);
                        if policy == FailStopPolicy::Shared {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        errors.push(SyncError::Other(anyhow::anyhow!(
                            "pipeline task panicked: {e}"
                        )));
                        break;
                    }
                },
            }
        }

        session.cancel();
        while let Some(joined) = pipelines.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(SyncError::Other(anyhow::anyhow!(
                    "pipeline task panicked: {e}"
                ))),
            }
        }

        // Report the failure that caused a halt, not its echoes
        let root_cause = errors
            .iter()
            .position(|e| !matches!(e, SyncError::PipelineHalted(_)))
            .unwrap_or(0);
        if errors.is_empty() {
            Ok(outcome)
        } else {
            Err(errors.swap_remove(root_cause))
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
