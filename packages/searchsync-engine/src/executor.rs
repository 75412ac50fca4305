//! Bounded task executor
//!
//! A semaphore in front of a `JoinSet`: the producer awaits a permit before
//! each spawn, so a fast producer (a table scan) cannot run more than
//! `max_in_flight` writes ahead of the index. The first failed task aborts
//! everything still in flight. Dropping the executor aborts its tasks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

use crate::error::{Result, SyncError};

pub struct BoundedExecutor<T> {
    name: String,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<T>>,
    completed: Vec<T>,
    submitted: usize,
}

impl<T: Send + 'static> BoundedExecutor<T> {
    pub fn new(name: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: JoinSet::new(),
            completed: Vec::new(),
            submitted: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Wait for a free slot, then spawn `task`.
    ///
    /// Returns the error of an earlier task if one failed in the meantime;
    /// in that case `task` is not spawned and the rest are aborted.
    pub async fn submit<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = Self::absorb(&mut self.completed, joined) {
                return Err(self.abort(e).await);
            }
        }

        let permit = loop {
            let failure = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => break permit,
                    Err(_) => SyncError::Cancelled(format!("{} executor closed", self.name)),
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match Self::absorb(&mut self.completed, joined) {
                        Ok(()) => continue,
                        Err(e) => e,
                    }
                }
            };
            return Err(self.abort(failure).await);
        };

        self.submitted += 1;
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
        Ok(())
    }

    /// Wait for every submitted task. Results come back in completion order.
    pub async fn join(mut self) -> Result<Vec<T>> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = Self::absorb(&mut self.completed, joined) {
                return Err(self.abort(e).await);
            }
        }
        debug!(
            executor = %self.name,
            tasks = self.submitted,
            "Executor drained"
        );
        Ok(std::mem::take(&mut self.completed))
    }

    fn absorb(
        completed: &mut Vec<T>,
        joined: std::result::Result<Result<T>, JoinError>,
    ) -> Result<()> {
        match joined {
            Ok(Ok(value)) => {
                completed.push(value);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Err(SyncError::Cancelled(e.to_string())),
            Err(e) => Err(SyncError::Other(anyhow::anyhow!("task panicked: {e}"))),
        }
    }

    async fn abort(&mut self, cause: SyncError) -> SyncError {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        debug!(executor = %self.name, error = %cause, "Executor aborted");
        cause
    }
}
