//! Replication counters.
//!
//! All counters are atomic and can be read while work is in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by logger, dispatchers and receiver.
#[derive(Debug, Default)]
pub struct SyncStats {
    tasks_logged: AtomicU64,
    entries_queued: AtomicU64,
    entries_merged: AtomicU64,
    entries_superseded: AtomicU64,
    entries_dropped: AtomicU64,
    tasks_held: AtomicU64,
    batches_sent: AtomicU64,
    tasks_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    tasks_applied: AtomicU64,
    tasks_skipped: AtomicU64,
    duplicates_ignored: AtomicU64,
    nacks_sent: AtomicU64,
    journal_compactions: AtomicU64,
    persistence_failures: AtomicU64,
}

impl SyncStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_logged(&self) {
        self.tasks_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.entries_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merged(&self) {
        self.entries_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_superseded(&self, count: u64) {
        self.entries_superseded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.entries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_held(&self) {
        self.tasks_held.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.journal_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a batch handed to the transport.
    pub fn record_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records acknowledged tasks.
    pub fn record_delivered(&self, count: u64) {
        self.tasks_delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a failed delivery attempt.
    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a task applied by the receiver.
    pub fn record_applied(&self) {
        self.tasks_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a task the receiver's handler skipped.
    pub fn record_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a duplicate the receiver acknowledged without applying.
    pub fn record_duplicate(&self) {
        self.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a nack sent by the receiver.
    pub fn record_nack(&self) {
        self.nacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tasks_logged: load(&self.tasks_logged),
            entries_queued: load(&self.entries_queued),
            entries_merged: load(&self.entries_merged),
            entries_superseded: load(&self.entries_superseded),
            entries_dropped: load(&self.entries_dropped),
            tasks_held: load(&self.tasks_held),
            batches_sent: load(&self.batches_sent),
            tasks_delivered: load(&self.tasks_delivered),
            delivery_failures: load(&self.delivery_failures),
            tasks_applied: load(&self.tasks_applied),
            tasks_skipped: load(&self.tasks_skipped),
            duplicates_ignored: load(&self.duplicates_ignored),
            nacks_sent: load(&self.nacks_sent),
            journal_compactions: load(&self.journal_compactions),
            persistence_failures: load(&self.persistence_failures),
        }
    }
}

/// Copy of [`SyncStats`] at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub tasks_logged: u64,
    pub entries_queued: u64,
    pub entries_merged: u64,
    pub entries_superseded: u64,
    pub entries_dropped: u64,
    pub tasks_held: u64,
    pub batches_sent: u64,
    pub tasks_delivered: u64,
    pub delivery_failures: u64,
    pub tasks_applied: u64,
    pub tasks_skipped: u64,
    pub duplicates_ignored: u64,
    pub nacks_sent: u64,
    pub journal_compactions: u64,
    pub persistence_failures: u64,
}
