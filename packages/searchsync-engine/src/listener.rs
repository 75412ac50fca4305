//! Buffering change listener
//!
//! Subscribes to a change source and forwards events into a bounded queue.
//! While a backfill runs the listener is started in buffering mode: events
//! are held in memory in arrival order and only forwarded once the buffer is
//! released, ahead of anything that arrives later.
//!
//! The buffer holds at most `queue_capacity` events. Once full the stream is
//! not polled again until release, which leaves the rest in the source.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use searchsync_storage::ResumeToken;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::change::{ChangeEvent, ChangeSource, ChangeStream};
use crate::error::{Result, SyncError};

pub struct ChangeListener {
    pipeline: String,
    source: Arc<dyn ChangeSource>,
    source_types: Vec<String>,
    queue_capacity: usize,
}

impl ChangeListener {
    pub fn new(
        pipeline: impl Into<String>,
        source: Arc<dyn ChangeSource>,
        source_types: Vec<String>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            source,
            source_types,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Subscribe and spawn the forwarding task.
    ///
    /// The subscription is established before this returns, so every change
    /// committed afterwards is observed.
    pub async fn start(
        self,
        resume_tokens: &HashMap<String, ResumeToken>,
        buffering: bool,
        cancel: CancellationToken,
    ) -> Result<(ListenerHandle, mpsc::Receiver<ChangeEvent>)> {
        let stream = self
            .source
            .subscribe(&self.source_types, resume_tokens)
            .await?;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (buffering_tx, buffering_rx) = watch::channel(buffering);
        let buffered = Arc::new(AtomicUsize::new(0));

        info!(
            pipeline = %self.pipeline,
            source_types = ?self.source_types,
            resumed = resume_tokens.len(),
            buffering,
            "Change listener started"
        );

        let task = tokio::spawn(forward(
            self.pipeline.clone(),
            stream,
            tx,
            buffering_rx,
            buffered.clone(),
            self.queue_capacity,
            cancel.clone(),
        ));

        let handle = ListenerHandle {
            pipeline: self.pipeline,
            buffering: buffering_tx,
            buffered,
            cancel,
            task,
        };
        Ok((handle, rx))
    }
}

async fn forward(
    pipeline: String,
    mut stream: ChangeStream,
    tx: mpsc::Sender<ChangeEvent>,
    mut buffering: watch::Receiver<bool>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buffer: VecDeque<ChangeEvent> = VecDeque::with_capacity(capacity);
    let mut watching = true;
    let mut reported_full = false;

    loop {
        let holding = *buffering.borrow();
        if !holding && !buffer.is_empty() {
            debug!(pipeline = %pipeline, events = buffer.len(), "Draining change buffer");
            while let Some(event) = buffer.pop_front() {
                buffered.fetch_sub(1, Ordering::Relaxed);
                if !send(&tx, event, &cancel).await {
                    return Ok(());
                }
            }
        }

        // Still holding with a full buffer: wait for release only
        let full = *buffering.borrow() && buffer.len() >= capacity;
        if full && !reported_full {
            warn!(pipeline = %pipeline, capacity, "Change buffer full, pausing the change stream");
        }
        reported_full = full;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = buffering.changed(), if watching => {
                // Handle dropped: keep whatever mode was last set
                if changed.is_err() {
                    watching = false;
                }
            }
            next = stream.next(), if !full => match next {
                None => {
                    debug!(pipeline = %pipeline, "Change stream ended");
                    return Ok(());
                }
                Some(Err(e)) => {
                    warn!(pipeline = %pipeline, error = %e, "Change stream failed");
                    return Err(e);
                }
                Some(Ok(event)) => {
                    // Queue behind a pending drain to keep arrival order
                    let holding = *buffering.borrow() || !buffer.is_empty();
                    if holding {
                        buffer.push_back(event);
                        buffered.fetch_add(1, Ordering::Relaxed);
                    } else if !send(&tx, event, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// False when the listener should stop: cancelled or the receiver is gone.
async fn send(tx: &mpsc::Sender<ChangeEvent>, event: ChangeEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

pub struct ListenerHandle {
    pipeline: String,
    buffering: watch::Sender<bool>,
    buffered: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Forward the buffered events, then keep forwarding live ones.
    pub fn release(&self) {
        let was_buffering = self.buffering.send_replace(false);
        if was_buffering {
            info!(
                pipeline = %self.pipeline,
                buffered = self.buffered(),
                "Releasing change buffer"
            );
        }
    }

    pub fn is_buffering(&self) -> bool {
        *self.buffering.borrow()
    }

    /// Events currently held back
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the forwarding task. Returns the change stream's error, if
    /// that is what ended it.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SyncError::Other(anyhow::anyhow!(
                "listener for {} panicked: {e}",
                self.pipeline
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeKind, InMemoryChangeSource};
    use std::time::Duration;

    fn listener(source: &InMemoryChangeSource) -> ChangeListener {
        ChangeListener::new(
            "search",
            Arc::new(source.clone()),
            vec!["service".to_string()],
            8,
        )
    }

    async fn wait_for_buffered(handle: &ListenerHandle, expected: usize) {
        for _ in 0..200 {
            if handle.buffered() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("buffer never reached {expected} events");
    }

    #[tokio::test]
    async fn test_buffered_events_are_released_in_order() {
        let source = InMemoryChangeSource::new();
        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(&source)
            .start(&HashMap::new(), true, cancel.clone())
            .await
            .unwrap();

        source.publish("service", ChangeKind::Insert, "a", None);
        source.publish("service", ChangeKind::Insert, "b", None);
        wait_for_buffered(&handle, 2).await;
        assert!(rx.try_recv().is_err());

        handle.release();
        source.publish("service", ChangeKind::Insert, "c", None);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            ids.push(event.document_id);
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(handle.buffered(), 0);

        cancel.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_pauses_the_stream() {
        let source = InMemoryChangeSource::new();
        let cancel = CancellationToken::new();
        let listener = ChangeListener::new(
            "search",
            Arc::new(source.clone()),
            vec!["service".to_string()],
            4,
        );
        let (handle, mut rx) = listener
            .start(&HashMap::new(), true, cancel.clone())
            .await
            .unwrap();

        let published: Vec<String> = (0..10).map(|i| format!("svc-{i}")).collect();
        for id in &published {
            source.publish("service", ChangeKind::Insert, id, None);
        }
        wait_for_buffered(&handle, 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.buffered(), 4);

        handle.release();
        let mut ids = Vec::new();
        for _ in 0..published.len() {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            ids.push(event.document_id);
        }
        assert_eq!(ids, published);
        assert_eq!(handle.buffered(), 0);

        cancel.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_passthrough_when_not_buffering() {
        let source = InMemoryChangeSource::new();
        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(&source)
            .start(&HashMap::new(), false, cancel.clone())
            .await
            .unwrap();
        assert!(!handle.is_buffering());

        source.publish("service", ChangeKind::Insert, "a", None);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.document_id, "a");

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_source_closes_queue() {
        let source = InMemoryChangeSource::new();
        let (handle, mut rx) = listener(&source)
            .start(&HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        source.close();

        assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_none());
        handle.join().await.unwrap();
    }
}
