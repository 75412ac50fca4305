//! Per-entity migration state machine
//!
//! ```text
//! Current ──► Stale ──► Migrating ──► Cutover ──► Current
//!               ▲           │            │
//!               │           ▼            │
//!               └────── Failed ◄─────────┘
//! ```
//!
//! Only the bulk engine drives it. The persisted `MigrationJob` marks the
//! `Migrating`/`Cutover` window so a crash in between is detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Live index matches the code's schema version
    Current,
    /// Version mismatch, forced rebuild or no live index yet
    Stale,
    /// Backfilling the new index
    Migrating,
    /// Swapping the alias and dropping the old index
    Cutover,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Current => "current",
            MigrationState::Stale => "stale",
            MigrationState::Migrating => "migrating",
            MigrationState::Cutover => "cutover",
            MigrationState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Current, Stale)
                | (Stale, Migrating)
                | (Migrating, Cutover)
                | (Cutover, Current)
                | (Migrating, Failed)
                | (Cutover, Failed)
                | (Failed, Stale)
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: MigrationState,
    pub to: MigrationState,
    pub at: DateTime<Utc>,
}

/// Migration state machine for one entity type
#[derive(Debug, Clone)]
pub struct MigrationStateMachine {
    entity_type: String,
    state: MigrationState,
    failure: Option<String>,
    history: Vec<StateChange>,
}

impl MigrationStateMachine {
    pub fn new(entity_type: impl Into<String>, initial: MigrationState) -> Self {
        Self {
            entity_type: entity_type.into(),
            state: initial,
            failure: None,
            history: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Reason of the last `fail` call
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Transition: CURRENT / FAILED → STALE
    pub fn mark_stale(&mut self) -> Result<()> {
        self.transition(MigrationState::Stale)
    }

    /// Transition: STALE → MIGRATING
    pub fn start_migration(&mut self) -> Result<()> {
        self.transition(MigrationState::Migrating)
    }

    /// Transition: MIGRATING → CUTOVER
    pub fn begin_cutover(&mut self) -> Result<()> {
        self.transition(MigrationState::Cutover)
    }

    /// Transition: CUTOVER → CURRENT
    pub fn complete(&mut self) -> Result<()> {
        self.transition(MigrationState::Current)?;
        self.failure = None;
        Ok(())
    }

    /// Transition: MIGRATING / CUTOVER → FAILED
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(MigrationState::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                entity_type: self.entity_type.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(StateChange {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}
