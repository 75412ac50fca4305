//! Bulk sync engine
//!
//! Rebuilds the index of every entity type whose live index is missing, of
//! another schema version, or flagged for rebuild. A rebuild never touches
//! the serving index: documents go into a fresh index, and readers switch
//! over with one atomic alias update.
//!
//! Per entity type:
//!
//! 1. persist a `MigrationJob` naming the new index
//! 2. create the index and backfill it from a full table scan
//! 3. swap the alias (add new, remove old) and verify it
//! 4. drop the old index
//! 5. record the new live index and version
//! 6. delete the job
//!
//! A job still present at startup marks an interrupted backfill. Its index
//! is dropped, unless the alias already serves it, in which case the
//! bookkeeping is rolled forward instead.

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use searchsync_storage::{IndexVersionState, MigrationJob, SyncStateStore};
use tracing::{error, info, warn};

use crate::entity::{EntityRegistry, SearchEntity};
use crate::error::{Result, SyncError};
use crate::executor::BoundedExecutor;
use crate::index_store::{AliasAction, IndexStore};
use crate::metrics::SyncMetricsTracker;
use crate::migration::{MigrationState, MigrationStateMachine};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    UpToDate,
    Migrated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySyncSummary {
    pub entity_type: String,
    pub outcome: EntityOutcome,
    pub live_index: String,
    pub documents_indexed: u64,
    pub documents_skipped: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkSyncReport {
    pub entities: Vec<EntitySyncSummary>,
    /// Indices of interrupted backfills that were dropped
    pub cleaned_up_indices: Vec<String>,
}

impl BulkSyncReport {
    pub fn migrated(&self) -> Vec<&str> {
        self.with_outcome(EntityOutcome::Migrated)
    }

    pub fn up_to_date(&self) -> Vec<&str> {
        self.with_outcome(EntityOutcome::UpToDate)
    }

    pub fn documents_indexed(&self) -> u64 {
        self.entities.iter().map(|e| e.documents_indexed).sum()
    }

    pub fn summary_of(&self, entity_type: &str) -> Option<&EntitySyncSummary> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    fn with_outcome(&self, outcome: EntityOutcome) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.outcome == outcome)
            .map(|e| e.entity_type.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
struct BackfillCounts {
    indexed: u64,
    skipped: u64,
}

pub struct BulkSyncEngine {
    registry: Arc<EntityRegistry>,
    index: Arc<dyn IndexStore>,
    state: Arc<dyn SyncStateStore>,
    metrics: SyncMetricsTracker,
    max_in_flight: usize,
    retry: RetryPolicy,
}

impl BulkSyncEngine {
    pub fn new(
        registry: Arc<EntityRegistry>,
        index: Arc<dyn IndexStore>,
        state: Arc<dyn SyncStateStore>,
        metrics: SyncMetricsTracker,
        max_in_flight: usize,
    ) -> Self {
        Self {
            registry,
            index,
            state,
            metrics,
            max_in_flight: max_in_flight.max(1),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for document writes
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Clean up interrupted backfills, then migrate every stale entity type.
    pub async fn run(&self) -> Result<BulkSyncReport> {
        let mut report = BulkSyncReport {
            cleaned_up_indices: self.cleanup_orphaned_jobs().await?,
            ..Default::default()
        };

        for entity in self.registry.iter() {
            let summary = if self.is_stale(entity).await? {
                self.migrate(entity).await?
            } else {
                let live_index = self
                    .state
                    .get_index_state(entity.entity_type())
                    .await?
                    .and_then(|s| s.live_index_name)
                    .unwrap_or_default();
                EntitySyncSummary {
                    entity_type: entity.entity_type().to_string(),
                    outcome: EntityOutcome::UpToDate,
                    live_index,
                    documents_indexed: 0,
                    documents_skipped: 0,
                    duration_ms: 0,
                }
            };
            report.entities.push(summary);
        }

        info!(
            migrated = ?report.migrated(),
            up_to_date = report.up_to_date().len(),
            documents = report.documents_indexed(),
            "Bulk sync finished"
        );
        Ok(report)
    }

    /// Entity types a `run` would migrate
    pub async fn stale_entities(&self) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for entity in self.registry.iter() {
            if self.is_stale(entity).await? {
                stale.push(entity.entity_type().to_string());
            }
        }
        Ok(stale)
    }

    /// Flag an entity type so the next run rebuilds it regardless of version
    pub async fn request_rebuild(&self, entity_type: &str) -> Result<()> {
        let entity = self.registry.get(entity_type)?;
        let Some(mut state) = self.state.get_index_state(entity.entity_type()).await? else {
            // Never synced, the next run builds it anyway
            return Ok(());
        };
        state.force_rebuild = true;
        state.updated_at = chrono::Utc::now();
        self.state.save_index_state(&state).await?;
        info!(entity_type, "Rebuild requested");
        Ok(())
    }

    async fn is_stale(&self, entity: &SearchEntity) -> Result<bool> {
        let Some(state) = self.state.get_index_state(entity.entity_type()).await? else {
            return Ok(true);
        };
        if state.needs_rebuild(entity.version()) {
            return Ok(true);
        }
        let Some(live) = state.live_index_name.as_deref() else {
            return Ok(true);
        };
        Ok(!self.index.index_exists(live).await?)
    }

    /// Resolve migration jobs left behind by a crash.
    ///
    /// Returns the names of the indices that were dropped.
    pub async fn cleanup_orphaned_jobs(&self) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        for job in self.state.list_migration_jobs().await? {
            let serving = match self.registry.get(&job.entity_type) {
                Ok(entity) => self
                    .index
                    .indices_for_alias(entity.alias())
                    .await?
                    .contains(&job.new_index_name),
                Err(_) => false,
            };

            if serving {
                warn!(
                    entity_type = %job.entity_type,
                    index = %job.new_index_name,
                    "Cutover finished before the crash, completing bookkeeping"
                );
                if let Some(old) = job.old_index_name.as_deref() {
                    if old != job.new_index_name {
                        self.index.delete_index(old).await?;
                    }
                }
                let state =
                    IndexVersionState::new(&job.entity_type, job.to_version, &job.new_index_name);
                self.state.save_index_state(&state).await?;
            } else {
                warn!(
                    entity_type = %job.entity_type,
                    index = %job.new_index_name,
                    "Dropping index of interrupted backfill"
                );
                if self.index.delete_index(&job.new_index_name).await? {
                    dropped.push(job.new_index_name.clone());
                }
            }
            self.state.delete_migration_job(&job.entity_type).await?;
        }
        Ok(dropped)
    }

    /// Rebuild one entity type into a fresh index and cut over to it.
    pub async fn migrate(&self, entity: &SearchEntity) -> Result<EntitySyncSummary> {
        let started = Instant::now();
        let entity_type = entity.entity_type();
        let mut machine = MigrationStateMachine::new(entity_type, MigrationState::Stale);

        let previous = self.state.get_index_state(entity_type).await?;
        let mut old_indices = self.index.indices_for_alias(entity.alias()).await?;
        if let Some(live) = previous.as_ref().and_then(|s| s.live_index_name.clone()) {
            if !old_indices.contains(&live) {
                old_indices.push(live);
            }
        }

        let new_index = entity.new_index_name();
        let job = MigrationJob::new(entity_type, &new_index, entity.version()).replacing(
            previous.as_ref().and_then(|s| s.live_index_name.clone()),
            previous.as_ref().map(|s| s.sync_version),
        );
        self.state.save_migration_job(&job).await?;
        machine.start_migration()?;
        info!(
            entity_type,
            index = %new_index,
            from_version = ?job.from_version,
            to_version = job.to_version,
            "Backfill started"
        );

        let counts = match self.backfill(entity, &new_index).await {
            Ok(counts) => counts,
            Err(e) => {
                machine.fail(e.to_string())?;
                error!(entity_type, index = %new_index, error = %e, "Backfill failed, job retained");
                return Err(match e {
                    SyncError::BackfillFailed { .. } => e,
                    other => SyncError::backfill(entity_type, other),
                });
            }
        };

        machine.begin_cutover()?;
        if let Err(e) = self.cutover(entity, &new_index, &old_indices).await {
            machine.fail(e.to_string())?;
            error!(entity_type, index = %new_index, error = %e, "Cutover failed, job retained");
            return Err(e);
        }

        self.state
            .save_index_state(&IndexVersionState::new(entity_type, entity.version(), &new_index))
            .await?;
        self.state.delete_migration_job(entity_type).await?;
        machine.complete()?;

        self.metrics.record_documents_indexed(entity_type, counts.indexed);
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            entity_type,
            index = %new_index,
            documents = counts.indexed,
            skipped = counts.skipped,
            duration_ms,
            "Migration complete"
        );

        Ok(EntitySyncSummary {
            entity_type: entity_type.to_string(),
            outcome: EntityOutcome::Migrated,
            live_index: new_index,
            documents_indexed: counts.indexed,
            documents_skipped: counts.skipped,
            duration_ms,
        })
    }

    async fn backfill(&self, entity: &SearchEntity, index: &str) -> Result<BackfillCounts> {
        self.index.create_index(index, entity.schema()).await?;

        let mut records = entity.records().scan().await?;
        let mut executor = BoundedExecutor::new(format!("backfill-{index}"), self.max_in_flight);
        let target: Arc<str> = Arc::from(index);
        let mut counts = BackfillCounts::default();

        while let Some(record) = records.next().await {
            let record = record?;
            let Some(doc) = entity.view().to_document(&record) else {
                counts.skipped += 1;
                continue;
            };
            let store = self.index.clone();
            let target = target.clone();
            let retry = self.retry;
            executor
                .submit(async move {
                    retry
                        .execute("upsert_document", || store.upsert_document(&target, &doc))
                        .await?;
                    Ok::<(), SyncError>(())
                })
                .await?;
        }

        counts.indexed = executor.join().await?.len() as u64;
        Ok(counts)
    }

    async fn cutover(&self, entity: &SearchEntity, new_index: &str, old: &[String]) -> Result<()> {
        let alias = entity.alias();
        let mut actions = vec![AliasAction::Add {
            index: new_index.to_string(),
        }];
        actions.extend(
            old.iter()
                .filter(|name| name.as_str() != new_index)
                .map(|name| AliasAction::Remove {
                    index: name.clone(),
                }),
        );

        self.index
            .update_aliases(alias, &actions)
            .await
            .map_err(|e| SyncError::CutoverFailed {
                alias: alias.to_string(),
                reason: e.to_string(),
            })?;

        let serving = self.index.indices_for_alias(alias).await?;
        if serving != [new_index.to_string()] {
            return Err(SyncError::CutoverFailed {
                alias: alias.to_string(),
                reason: format!("alias resolves to {serving:?}"),
            });
        }
        info!(entity_type = entity.entity_type(), alias, index = new_index, "Alias swapped");

        for name in old.iter().filter(|name| name.as_str() != new_index) {
            if let Err(e) = self.index.delete_index(name).await {
                warn!(index = %name, error = %e, "Failed to drop old index");
            }
        }
        Ok(())
    }
}
