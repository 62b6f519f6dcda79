//! Operational events.
//!
//! Delivery problems are not errors any caller can handle: the task was
//! already captured and queued. They surface here instead, for alerting and
//! for operators.
//!
//! # Usage
//!
//! ```rust
//! use farmsync_core::{EventFeed, SyncEvent};
//!
//! let feed = EventFeed::new();
//! let receiver = feed.subscribe();
//! feed.emit(SyncEvent::TargetRecovered { target: "node-2".into() });
//! assert!(matches!(receiver.recv().unwrap(), SyncEvent::TargetRecovered { .. }));
//! ```

use farmsync_protocol::{SequenceId, ServerId, TaskKindId};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

/// Something an operator may need to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A target exceeded its retry bound and is now considered unreachable.
    TargetUnreachable {
        /// Target server.
        target: ServerId,
        /// Head entry that keeps failing.
        sequence_id: SequenceId,
        /// Failed attempts of that entry.
        retry_count: u32,
        /// Last error.
        error: String,
    },
    /// An unreachable target accepted a delivery again.
    TargetRecovered {
        /// Target server.
        target: ServerId,
    },
    /// One delivery attempt failed (retried).
    DeliveryFailed {
        /// Target server.
        target: ServerId,
        /// Head entry of the failed batch.
        sequence_id: SequenceId,
        /// Failed attempts so far.
        retry_count: u32,
        /// Failure detail.
        error: String,
    },
    /// A non-critical task was not queued because the queue was full.
    EntryDropped {
        /// Target server.
        target: ServerId,
        /// Dropped task.
        sequence_id: SequenceId,
        /// Its kind.
        kind: TaskKindId,
    },
    /// A staged object references something the target does not have and
    /// the dependency could not be synchronized first.
    MissingDependency {
        /// Target server.
        target: ServerId,
        /// Task that cannot be sent.
        sequence_id: SequenceId,
        /// Type of the missing object.
        object_type: String,
        /// Source-environment id of the missing object.
        source_id: i64,
    },
    /// An administrator abandoned every entry of a target.
    TargetPurged {
        /// Target server.
        target: ServerId,
        /// Number of abandoned entries.
        abandoned: usize,
    },
}

impl SyncEvent {
    /// Returns the target the event is about.
    #[must_use]
    pub fn target(&self) -> &ServerId {
        match self {
            Self::TargetUnreachable { target, .. }
            | Self::TargetRecovered { target }
            | Self::DeliveryFailed { target, .. }
            | Self::EntryDropped { target, .. }
            | Self::MissingDependency { target, .. }
            | Self::TargetPurged { target, .. } => target,
        }
    }
}

/// Fan-out of [`SyncEvent`]s to subscribers, with a bounded history.
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<SyncEvent>>>,
    history: RwLock<VecDeque<SyncEvent>>,
    max_history: usize,
}

impl EventFeed {
    /// Creates a feed keeping 1000 events of history.
    pub fn new() -> Self {
        Self::with_max_history(1000)
    }

    /// Creates a feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers and the history.
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns recent events, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SyncEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovered(name: &str) -> SyncEvent {
        SyncEvent::TargetRecovered {
            target: ServerId::new(name),
        }
    }

    #[test]
    fn subscribers_receive_events() {
        let feed = EventFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(recovered("node-2"));
        assert_eq!(rx1.recv().unwrap(), recovered("node-2"));
        assert_eq!(rx2.recv().unwrap().target().as_str(), "node-2");
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        drop(rx);
        feed.emit(recovered("node-2"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let feed = EventFeed::with_max_history(2);
        for name in ["a", "b", "c"] {
            feed.emit(recovered(name));
        }
        let history = feed.history();
        assert_eq!(history, vec![recovered("b"), recovered("c")]);
    }
}
