//! Per-target delivery queue.
//!
//! The queue is strictly ordered by sequence id. Producers (the task logger)
//! only append through [`DeliveryQueue::push`], which runs the optimizer; the
//! target's dispatcher is the only consumer and moves entries through
//! `Pending -> InFlight -> (removed | Failed)`.

use crate::optimizer::{self, Optimization};
use crate::registry::OptimizationPolicy;
use farmsync_protocol::{SequenceId, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Delivery state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting to be sent.
    Pending,
    /// Part of the batch currently being sent.
    InFlight,
    /// The last attempt failed.
    Failed {
        /// Number of failed attempts so far.
        retry_count: u32,
    },
}

/// A task bound to one delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// The task to deliver.
    pub task: Task,
    /// Delivery state.
    pub state: EntryState,
    /// Whether the task's kind is critical (and therefore journaled).
    pub critical: bool,
    /// Failed attempts, kept across `InFlight` transitions.
    pub retry_count: u32,
}

impl QueueEntry {
    /// Creates a pending entry.
    pub fn pending(task: Task, critical: bool) -> Self {
        Self {
            task,
            state: EntryState::Pending,
            critical,
            retry_count: 0,
        }
    }

    /// Returns the entry's sequence id.
    #[must_use]
    pub fn sequence_id(&self) -> SequenceId {
        self.task.sequence_id
    }

    /// Returns true if the optimizer may touch this entry.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == EntryState::Pending
    }
}

/// What happened to a task handed to [`DeliveryQueue::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended at the tail.
    Appended,
    /// Appended after removing superseded pending entries.
    Superseded {
        /// Sequence ids of the removed entries.
        removed: Vec<SequenceId>,
    },
    /// Merged into an earlier pending entry.
    Merged {
        /// The entry after merging (keeps the earlier sequence id).
        merged: Task,
        /// Sequence id of the absorbed task.
        absorbed: SequenceId,
    },
    /// Not queued because the queue is full and the task is not critical.
    Dropped,
}

/// Ordered queue of entries for one target.
#[derive(Debug)]
pub struct DeliveryQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    max_pending: usize,
}

impl DeliveryQueue {
    /// Creates a queue with the given bound for non-critical entries.
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_pending,
        }
    }

    /// Adds a task, optimizing against pending entries.
    pub fn push<F>(
        &self,
        task: Task,
        critical: bool,
        policy: OptimizationPolicy,
        merge: F,
    ) -> EnqueueOutcome
    where
        F: Fn(&Task, &Task) -> Vec<u8>,
    {
        let outcome = {
            let mut entries = self.entries.lock();
            match optimizer::optimize(&mut entries, &task, policy, merge) {
                Optimization::Merged { merged, absorbed } => {
                    EnqueueOutcome::Merged { merged, absorbed }
                }
                Optimization::Superseded { removed } => {
                    entries.push_back(QueueEntry::pending(task, critical));
                    EnqueueOutcome::Superseded { removed }
                }
                Optimization::Append => {
                    if !critical && entries.len() >= self.max_pending {
                        return EnqueueOutcome::Dropped;
                    }
                    entries.push_back(QueueEntry::pending(task, critical));
                    EnqueueOutcome::Appended
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Appends an entry without optimizing. Used by journal recovery.
    pub(crate) fn restore(&self, entry: QueueEntry) {
        self.entries.lock().push_back(entry);
        self.notify.notify_one();
    }

    /// Marks the head entries as `InFlight` and returns their tasks.
    ///
    /// Takes at most `max` entries; a `Failed` head is retried first.
    /// Returns an empty batch if a batch is already in flight.
    pub fn take_batch(&self, max: usize) -> Vec<Task> {
        let mut entries = self.entries.lock();
        if entries
            .front()
            .map_or(false, |e| e.state == EntryState::InFlight)
        {
            return Vec::new();
        }

        let mut batch = Vec::new();
        for entry in entries.iter_mut().take(max) {
            if entry.state == EntryState::InFlight {
                break;
            }
            entry.state = EntryState::InFlight;
            batch.push(entry.task.clone());
        }
        batch
    }

    /// Removes up to `count` in-flight entries from the head.
    ///
    /// Returns the removed entries (the delivered ones).
    pub fn complete(&self, count: usize) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::with_capacity(count);
        while removed.len() < count {
            match entries.front() {
                Some(e) if e.state == EntryState::InFlight => {
                    if let Some(entry) = entries.pop_front() {
                        removed.push(entry);
                    }
                }
                _ => break,
            }
        }
        removed
    }

    /// Marks the in-flight head `Failed` and returns its sequence id and
    /// retry count, or `None` if nothing is in flight.
    ///
    /// The rest of the batch goes back to its previous state.
    pub fn fail_head(&self) -> Option<(SequenceId, u32)> {
        let mut entries = self.entries.lock();
        let mut head = None;
        for (index, entry) in entries.iter_mut().enumerate() {
            if entry.state != EntryState::InFlight {
                break;
            }
            if index == 0 {
                entry.retry_count += 1;
                head = Some((entry.sequence_id(), entry.retry_count));
            }
            entry.state = Self::resting_state(entry.retry_count);
        }
        head
    }

    /// Returns in-flight entries to `Pending`/`Failed` without counting an
    /// attempt. Called when a dispatcher stops.
    pub fn reset_in_flight(&self) {
        for entry in self.entries.lock().iter_mut() {
            if entry.state == EntryState::InFlight {
                entry.state = Self::resting_state(entry.retry_count);
            }
        }
    }

    fn resting_state(retry_count: u32) -> EntryState {
        if retry_count == 0 {
            EntryState::Pending
        } else {
            EntryState::Failed { retry_count }
        }
    }

    /// Removes every entry. Used when a target is purged.
    pub fn drain(&self) -> Vec<QueueEntry> {
        self.entries.lock().drain(..).collect()
    }

    /// Returns a copy of the entries in queue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of entries still waiting for their first attempt.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.is_pending()).count()
    }

    /// Resolves once something is pushed after this call.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::TaskKindId;

    fn task(seq: u64, kind: &str, key: &str, payload: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new(kind),
            object_type: "cache".into(),
            target_key: key.into(),
            payload: payload.as_bytes().to_vec(),
            origin: "node-a".into(),
            created_at: seq,
            groups: Vec::new(),
            schema_version: 1,
        }
    }

    fn later(_: &Task, later: &Task) -> Vec<u8> {
        later.payload.clone()
    }

    fn push(queue: &DeliveryQueue, t: Task) -> EnqueueOutcome {
        queue.push(t, true, OptimizationPolicy::None, later)
    }

    #[test]
    fn batch_is_taken_from_head_in_order() {
        let queue = DeliveryQueue::new(100);
        for seq in 1..=5 {
            push(&queue, task(seq, "k", &format!("key:{seq}"), "p"));
        }

        let batch = queue.take_batch(3);
        let seqs: Vec<_> = batch.iter().map(|t| t.sequence_id.0).collect();
        assert_eq!(seqs, [1, 2, 3]);
        assert!(queue.take_batch(3).is_empty());

        let delivered = queue.complete(3);
        assert_eq!(delivered.len(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take_batch(10)[0].sequence_id, SequenceId(4));
    }

    #[test]
    fn failed_head_keeps_its_place() {
        let queue = DeliveryQueue::new(100);
        push(&queue, task(10, "k", "doc:5", "update"));
        push(&queue, task(11, "k", "doc:5", "delete"));

        queue.take_batch(2);
        assert_eq!(queue.fail_head(), Some((SequenceId(10), 1)));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].state, EntryState::Failed { retry_count: 1 });
        assert_eq!(snapshot[1].state, EntryState::Pending);

        queue.take_batch(2);
        assert_eq!(queue.fail_head(), Some((SequenceId(10), 2)));
        assert_eq!(queue.snapshot()[0].retry_count, 2);
        assert_eq!(queue.fail_head(), None);
    }

    #[test]
    fn partial_ack_only_removes_prefix() {
        let queue = DeliveryQueue::new(100);
        for seq in 1..=3 {
            push(&queue, task(seq, "k", "a", "p"));
        }
        queue.take_batch(3);
        assert_eq!(queue.complete(1).len(), 1);
        assert_eq!(queue.fail_head(), Some((SequenceId(2), 1)));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].sequence_id(), SequenceId(2));
        assert_eq!(snapshot[0].state, EntryState::Failed { retry_count: 1 });
    }

    #[test]
    fn reset_returns_batch_without_counting() {
        let queue = DeliveryQueue::new(100);
        push(&queue, task(1, "k", "a", "p"));
        queue.take_batch(1);
        queue.reset_in_flight();
        assert_eq!(queue.snapshot()[0].state, EntryState::Pending);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn full_queue_drops_only_non_critical() {
        let queue = DeliveryQueue::new(1);
        push(&queue, task(1, "k", "a", "p"));

        let dropped = queue.push(task(2, "k", "b", "p"), false, OptimizationPolicy::None, later);
        assert_eq!(dropped, EnqueueOutcome::Dropped);

        let kept = queue.push(task(3, "k", "c", "p"), true, OptimizationPolicy::None, later);
        assert_eq!(kept, EnqueueOutcome::Appended);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn superseding_a_full_queue_still_works() {
        let queue = DeliveryQueue::new(1);
        queue.push(task(1, "inv", "page:42", "a"), false, OptimizationPolicy::DropSuperseded, later);
        let outcome =
            queue.push(task(2, "inv", "page:42", "b"), false, OptimizationPolicy::DropSuperseded, later);
        assert_eq!(
            outcome,
            EnqueueOutcome::Superseded {
                removed: vec![SequenceId(1)]
            }
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn push_wakes_consumer() {
        let queue = std::sync::Arc::new(DeliveryQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.len()
            })
        };
        tokio::task::yield_now().await;
        push(&queue, task(1, "k", "a", "p"));
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
