//! Change events and the change-feed port
//!
//! A change source delivers committed changes of the system of record, per
//! source type, in commit order, each stamped with a resume token. The
//! engine never looks inside a token; it only compares and persists them.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;

use searchsync_storage::ResumeToken;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One committed change.
///
/// `full_document` is the post-image for inserts and updates. For deletes it
/// is the last known state of the row when the source can provide it.
/// `previous_document` is the pre-image of an update, when available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_type: String,
    pub kind: ChangeKind,
    pub resume_token: ResumeToken,
    pub document_id: String,
    pub full_document: Option<Value>,
    #[serde(default)]
    pub previous_document: Option<Value>,
}

impl ChangeEvent {
    pub fn new(
        source_type: impl Into<String>,
        kind: ChangeKind,
        resume_token: ResumeToken,
        document_id: impl Into<String>,
        full_document: Option<Value>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            kind,
            resume_token,
            document_id: document_id.into(),
            full_document,
            previous_document: None,
        }
    }

    pub fn with_previous_document(mut self, pre_image: Value) -> Self {
        self.previous_document = Some(pre_image);
        self
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Change feed port.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Stream changes of `source_types`.
    ///
    /// A source type with an entry in `resume_tokens` resumes strictly after
    /// that token. A source type without one starts at the live tail.
    async fn subscribe(
        &self,
        source_types: &[String],
        resume_tokens: &HashMap<String, ResumeToken>,
    ) -> Result<ChangeStream>;

    /// A token for each of `source_types` that resumes exactly at the
    /// current tail: nothing already in the feed, everything after it.
    ///
    /// Persisting these before the first subscription turns "start at the
    /// live tail" into a durable position, so changes made while nobody is
    /// listening are replayed later.
    async fn current_position(
        &self,
        source_types: &[String],
    ) -> Result<HashMap<String, ResumeToken>>;
}

#[derive(Default)]
struct ChangeLog {
    events: Vec<ChangeEvent>,
    sequence: u64,
    closed: bool,
}

/// Ordered, resumable in-process change log.
///
/// Tokens come from one global sequence, so they increase per source type
/// as well as overall. `close` ends every open subscription once it has
/// drained the log.
#[derive(Clone, Default)]
pub struct InMemoryChangeSource {
    log: Arc<Mutex<ChangeLog>>,
    notify: Arc<Notify>,
}

impl InMemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change and wake subscribers.
    pub fn publish(
        &self,
        source_type: &str,
        kind: ChangeKind,
        document_id: &str,
        full_document: Option<Value>,
    ) -> ResumeToken {
        let token = {
            let mut log = self.log.lock();
            log.sequence += 1;
            let token = ResumeToken::from_sequence(log.sequence);
            log.events.push(ChangeEvent::new(
                source_type,
                kind,
                token.clone(),
                document_id,
                full_document,
            ));
            token
        };
        self.notify.notify_waiters();
        token
    }

    pub fn close(&self) {
        self.log.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().events.is_empty()
    }

    /// Token of the most recent change
    pub fn last_token(&self) -> Option<ResumeToken> {
        self.log.lock().events.last().map(|e| e.resume_token.clone())
    }
}

enum StartAt {
    After(ResumeToken),
    Position(usize),
}

struct Subscription {
    log: Arc<Mutex<ChangeLog>>,
    notify: Arc<Notify>,
    start: HashMap<String, StartAt>,
    cursor: usize,
}

impl Subscription {
    fn wants(&self, position: usize, event: &ChangeEvent) -> bool {
        match self.start.get(&event.source_type) {
            Some(StartAt::After(token)) => event.resume_token > *token,
            Some(StartAt::Position(first)) => position >= *first,
            None => false,
        }
    }

    /// Next matching event, or `Err(closed)` when nothing is pending
    fn poll_log(&mut self) -> std::result::Result<ChangeEvent, bool> {
        let log = self.log.lock();
        while self.cursor < log.events.len() {
            let position = self.cursor;
            self.cursor += 1;
            let event = &log.events[position];
            if self.wants(position, event) {
                return Ok(event.clone());
            }
        }
        Err(log.closed)
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeSource {
    async fn subscribe(
        &self,
        source_types: &[String],
        resume_tokens: &HashMap<String, ResumeToken>,
    ) -> Result<ChangeStream> {
        let tail = self.log.lock().events.len();
        let wanted: HashSet<&String> = source_types.iter().collect();
        let start = wanted
            .into_iter()
            .map(|source_type| {
                let at = match resume_tokens.get(source_type) {
                    Some(token) => StartAt::After(token.clone()),
                    None => StartAt::Position(tail),
                };
                (source_type.clone(), at)
            })
            .collect();

        let subscription = Subscription {
            log: self.log.clone(),
            notify: self.notify.clone(),
            start,
            cursor: 0,
        };

        let stream = stream::unfold(subscription, |mut sub| async move {
            loop {
                let notify = sub.notify.clone();
                // Registered before the log check so a publish in between is not missed
                let notified = notify.notified();
                match sub.poll_log() {
                    Ok(event) => return Some((Ok(event), sub)),
                    Err(true) => return None,
                    Err(false) => notified.await,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn current_position(
        &self,
        source_types: &[String],
    ) -> Result<HashMap<String, ResumeToken>> {
        let token = ResumeToken::from_sequence(self.log.lock().sequence);
        Ok(source_types
            .iter()
            .map(|source_type| (source_type.clone(), token.clone()))
            .collect())
    }
}
