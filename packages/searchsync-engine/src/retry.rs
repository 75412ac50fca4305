//! Bounded fixed-delay retry for storage calls
//!
//! Only errors classified as transient are retried; everything else is
//! surfaced on the first attempt.

use std::future::Future;
use std::time::Duration;

use searchsync_storage::StorageError;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{IndexError, SyncError};

/// Errors that know whether a retry could help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for IndexError {
    fn is_transient(&self) -> bool {
        IndexError::is_transient(self)
    }
}

impl Retryable for SyncError {
    fn is_transient(&self) -> bool {
        SyncError::is_transient(self)
    }
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            delay: config.delay(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempts
    /// run out. The last error is returned unchanged.
    pub async fn execute<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.attempts,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Free-function form of [`RetryPolicy::execute`]
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    policy.execute(operation_name, operation).await
}
