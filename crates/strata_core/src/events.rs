//! Record event feed.
//!
//! The feed distributes record-level events to subscribers and keeps a
//! bounded history for polling. Events are emitted after the state change
//! they describe has been applied, in application order.

use crate::merge::MergeOutcome;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of a record event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEventKind {
    /// Inbound remote/live data was merged. Fires for every inbound
    /// payload, alongside exactly one of `FullUpdate`/`PartialUpdate`.
    RemoteUpdate,
    /// The inbound payload was the complete remote state, no conflicts.
    FullUpdate,
    /// The inbound payload partially applied or conflicted.
    PartialUpdate,
    /// A relation rewrote key fields on this record.
    KeyUpdate,
    /// A relation's related record or collection changed.
    RelationUpdate,
    /// The record was removed.
    Removed,
    /// A local save succeeded.
    SavedLocally,
    /// A remote save succeeded.
    SavedRemotely,
}

/// A single event from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEvent {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Model name.
    pub model: String,
    /// Flattened record key.
    pub key: String,
    /// What happened.
    pub kind: RecordEventKind,
    /// Merge details for update events.
    pub merge: Option<MergeOutcome>,
}

impl RecordEvent {
    /// Builds an event without merge details.
    pub fn new(model: impl Into<String>, key: impl Into<String>, kind: RecordEventKind) -> Self {
        Self {
            sequence: 0,
            model: model.into(),
            key: key.into(),
            kind,
            merge: None,
        }
    }

    /// Attaches merge details.
    #[must_use]
    pub fn with_merge(mut self, merge: MergeOutcome) -> Self {
        self.merge = Some(merge);
        self
    }
}

/// Distributes record events to subscribers, preserving emission order.
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<RecordEvent>>>,
    history: RwLock<Vec<RecordEvent>>,
    next_sequence: AtomicU64,
    max_history: usize,
}

impl EventFeed {
    /// Creates a feed with the default history bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(1024)
    }

    /// Creates a feed keeping at most `max_history` events for polling.
    #[must_use]
    pub fn with_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            max_history,
        }
    }

    /// Subscribes to all subsequent events.
    pub fn subscribe(&self) -> Receiver<RecordEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.write().push(sender);
        receiver
    }

    /// Emits an event, assigning it the next sequence number.
    pub fn emit(&self, mut event: RecordEvent) {
        event.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            sequence = event.sequence,
            model = %event.model,
            key = %event.key,
            kind = ?event.kind,
            "record event"
        );

        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(..excess);
            }
        }

        self.subscribers
            .write()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Polls events with sequence greater than `cursor`, up to `limit`.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<RecordEvent> {
        self.history
            .read()
            .iter()
            .filter(|event| event.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest assigned sequence number.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}
