//! Node configuration for the task logger.

use crate::versions::DEFAULT_VERSION_RETENTION;
use farmsync_protocol::ServerId;
use std::time::Duration;

/// Configuration of the local node's logging side.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Identity stamped on every task this node produces.
    pub server_id: ServerId,

    /// Whether to sync the journal on every write (safer but slower).
    pub sync_on_write: bool,

    /// How many sequence ids one `Reserve` journal record covers.
    pub sequence_block: u64,

    /// Number of dead journal records that triggers compaction (0 = never).
    pub compaction_threshold: u64,

    /// Per-target queue bound; non-critical tasks beyond it are dropped.
    pub max_pending: usize,

    /// Number of events the event feed keeps for polling.
    pub event_history: usize,

    /// How long an untouched object version is remembered (`None` = forever).
    pub version_retention: Option<Duration>,
}

impl CoreConfig {
    /// Creates a configuration with default values for the given node.
    #[must_use]
    pub fn new(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            sync_on_write: true,
            sequence_block: 1_000,
            compaction_threshold: 10_000,
            max_pending: 100_000,
            event_history: 1_000,
            version_retention: Some(DEFAULT_VERSION_RETENTION),
        }
    }

    /// Sets whether to sync the journal on every write.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the size of a sequence id reservation block.
    #[must_use]
    pub fn sequence_block(mut self, block: u64) -> Self {
        self.sequence_block = block.max(1);
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Sets the per-target queue bound.
    #[must_use]
    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Sets the event history size.
    #[must_use]
    pub fn event_history(mut self, size: usize) -> Self {
        self.event_history = size;
        self
    }

    /// Sets how long object versions are remembered.
    #[must_use]
    pub fn version_retention(mut self, retention: Option<Duration>) -> Self {
        self.version_retention = retention;
        self
    }
}
