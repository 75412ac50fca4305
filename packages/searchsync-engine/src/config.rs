//! Sync engine configuration (YAML loading + validation)
//!
//! Every section has defaults, so an empty document is a valid config.
//! Durations are expressed in milliseconds.
//!
//! ```yaml
//! lock:
//!   lock_name: search_sync
//!   ttl_ms: 30000
//!   heartbeat_interval_ms: 10000
//! bulk:
//!   max_in_flight: 8
//! realtime:
//!   queue_capacity: 1024
//!   fail_stop: independent
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Two fields disagree
    #[error("Configuration conflict: {issue}. Fix: {fix}")]
    Conflict { issue: String, fix: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn range_check(field: &str, value: u64, min: u64, max: u64, hint: &str) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Range {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.to_string(),
        });
    }
    Ok(())
}

/// Whether a halted pipeline also halts its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailStopPolicy {
    /// One failing pipeline stops all of them
    #[default]
    Shared,
    /// Each pipeline stops on its own failures only
    Independent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub lock_name: String,
    /// How long a record stays valid without a heartbeat
    pub ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Wait between acquisition attempts while another owner holds the lock
    pub acquire_backoff_ms: u64,
    /// Pause between creating the record and re-checking ownership
    pub readiness_window_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_name: "search_sync".to_string(),
            ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            acquire_backoff_ms: 5_000,
            readiness_window_ms: 1_000,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn readiness_window(&self) -> Duration {
        Duration::from_millis(self.readiness_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkConfig {
    /// Backfill tasks allowed in flight at once (semaphore permits)
    pub max_in_flight: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_in_flight: (num_cpus::get() / 2).max(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeConfig {
    /// Bounded queue between change listener and dispatcher
    pub queue_capacity: usize,
    pub fail_stop: FailStopPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            fail_stop: FailStopPolicy::Shared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Stable owner id for the lock; a random one is generated when absent
    pub owner_id: Option<String>,
    /// Wait before a failed session is retried
    pub restart_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            restart_backoff_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub lock: LockConfig,
    pub bulk: BulkConfig,
    pub realtime: RealtimeConfig,
    pub retry: RetryConfig,
    pub coordinator: CoordinatorConfig,
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lock = &self.lock;
        if lock.lock_name.trim().is_empty() {
            return Err(ConfigError::Conflict {
                issue: "lock.lock_name is empty".to_string(),
                fix: "set a lock name shared by all sync processes".to_string(),
            });
        }
        range_check("lock.ttl_ms", lock.ttl_ms, 1, 3_600_000, "TTL is at most one hour")?;
        range_check(
            "lock.heartbeat_interval_ms",
            lock.heartbeat_interval_ms,
            1,
            600_000,
            "",
        )?;
        if lock.heartbeat_interval_ms >= lock.ttl_ms {
            return Err(ConfigError::Conflict {
                issue: format!(
                    "heartbeat interval {}ms is not shorter than ttl {}ms",
                    lock.heartbeat_interval_ms, lock.ttl_ms
                ),
                fix: "the lock would expire between heartbeats; lower heartbeat_interval_ms"
                    .to_string(),
            });
        }
        range_check(
            "bulk.max_in_flight",
            self.bulk.max_in_flight as u64,
            1,
            4_096,
            "",
        )?;
        range_check(
            "realtime.queue_capacity",
            self.realtime.queue_capacity as u64,
            1,
            1_000_000,
            "",
        )?;
        range_check("retry.attempts", self.retry.attempts as u64, 1, 100, "")?;
        Ok(())
    }

    /// Shrink every interval, for tests and local demos.
    pub fn fast() -> Self {
        Self {
            lock: LockConfig {
                lock_name: "search_sync".to_string(),
                ttl_ms: 600,
                heartbeat_interval_ms: 100,
                acquire_backoff_ms: 50,
                readiness_window_ms: 20,
            },
            bulk: BulkConfig { max_in_flight: 4 },
            realtime: RealtimeConfig {
                queue_capacity: 64,
                fail_stop: FailStopPolicy::Shared,
            },
            retry: RetryConfig {
                attempts: 3,
                delay_ms: 10,
            },
            coordinator: CoordinatorConfig {
                owner_id: None,
                restart_backoff_ms: 100,
            },
        }
    }
}
