//! Last known version of every object this node has written.
//!
//! Local writes and applied remote tasks both land in one [`VersionLedger`]
//! per node. The logger stamps a local write past the version it
//! overwrites, and the receiver checks incoming tasks against the same
//! ledger, so every node reaches the same last-writer-wins verdict no
//! matter which side of a conflict it started on.
//!
//! Entries not touched for the retention window are forgotten. A task
//! older than the window that arrives afterwards is admitted as if the
//! object had never been written.

use farmsync_protocol::{ServerId, VersionStamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

type ObjectKey = (String, String);

#[derive(Debug, Clone)]
struct LedgerEntry {
    stamp: VersionStamp,
    seen_at: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<ObjectKey, LedgerEntry>,
    last_prune: u64,
}

/// Version stamps keyed by `(object_type, target_key)`.
#[derive(Debug)]
pub struct VersionLedger {
    retention_ms: Option<u64>,
    state: Mutex<LedgerState>,
}

impl VersionLedger {
    /// Creates a ledger that forgets entries idle for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: Some(retention.as_millis() as u64),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Creates a ledger that never forgets.
    pub fn unbounded() -> Self {
        Self {
            retention_ms: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Creates a ledger from an optional retention window.
    pub fn with_retention(retention: Option<Duration>) -> Self {
        retention.map_or_else(Self::unbounded, Self::new)
    }

    /// Returns the retention window, if any.
    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    /// Returns the stamp of the last write to an object.
    pub fn current(&self, object_type: &str, target_key: &str) -> Option<VersionStamp> {
        self.state
            .lock()
            .entries
            .get(&(object_type.to_string(), target_key.to_string()))
            .map(|entry| entry.stamp.clone())
    }

    /// Records a local write at `now` and returns its capture time.
    ///
    /// The time is moved past the last known stamp of the object, so the
    /// local write wins over whatever it overwrote even with clocks apart.
    pub fn stamp_local(
        &self,
        object_type: &str,
        target_key: &str,
        origin: &ServerId,
        now: u64,
    ) -> u64 {
        let mut state = self.state.lock();
        let key = (object_type.to_string(), target_key.to_string());
        let created_at = match state.entries.get(&key) {
            Some(entry) if entry.stamp.created_at >= now => entry.stamp.created_at + 1,
            _ => now,
        };
        state.entries.insert(
            key,
            LedgerEntry {
                stamp: VersionStamp::new(created_at, origin.clone()),
                seen_at: now,
            },
        );
        self.maybe_prune(&mut state, now);
        created_at
    }

    /// Records an applied write.
    pub fn record(&self, object_type: &str, target_key: &str, stamp: VersionStamp, now: u64) {
        let mut state = self.state.lock();
        state.entries.insert(
            (object_type.to_string(), target_key.to_string()),
            LedgerEntry { stamp, seen_at: now },
        );
        self.maybe_prune(&mut state, now);
    }

    /// Returns the number of objects tracked.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets entries idle since before `now - retention`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, now: u64) -> usize {
        let mut state = self.state.lock();
        self.prune_locked(&mut state, now)
    }

    /// Prunes at most a few times per retention window.
    fn maybe_prune(&self, state: &mut LedgerState, now: u64) {
        let Some(retention) = self.retention_ms else {
            return;
        };
        if now.saturating_sub(state.last_prune) >= (retention / 8).max(1) {
            self.prune_locked(state, now);
        }
    }

    fn prune_locked(&self, state: &mut LedgerState, now: u64) -> usize {
        let Some(retention) = self.retention_ms else {
            return 0;
        };
        state.last_prune = now;
        let cutoff = now.saturating_sub(retention);
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.seen_at >= cutoff);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, remaining = state.entries.len(), "version ledger pruned");
        }
        removed
    }
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_VERSION_RETENTION)
    }
}

/// How long an untouched version stamp is kept by default.
pub const DEFAULT_VERSION_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
