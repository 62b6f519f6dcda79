//! Node configuration file.
//!
//! A node is described by one TOML file:
//!
//! ```toml
//! server_id = "farm-node-1"
//! data_dir = "/var/lib/farmsync"
//! listen = "0.0.0.0:8640"
//!
//! [[trusted_senders]]
//! server_id = "farm-node-2"
//! token = "shared-secret"
//!
//! [[targets]]
//! server_id = "farm-node-2"
//! base_url = "http://farm-node-2:8640"
//! token = "shared-secret"
//!
//! [[targets]]
//! server_id = "staging-env-1"
//! base_url = "https://staging.example.com"
//! token = "staging-secret"
//! role = "staging"
//! mode = "manual"
//! groups = ["content"]
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! ```
//!
//! Every section except the top-level ids is optional.

use farmsync_core::{CoreConfig, DeliveryTarget};
use farmsync_engine::{DispatchConfig, RetryConfig};
use farmsync_protocol::{ConflictPolicy, ServerId};
use farmsync_server::ServerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a node file.
#[derive(Debug, Error)]
pub enum NodeConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },
    /// The file is not valid TOML for a node.
    #[error("invalid node file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Cause.
        source: toml::de::Error,
    },
    /// The file parsed but describes an impossible node.
    #[error("invalid node file: {0}")]
    Invalid(String),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8640))
}

/// A node that may send tasks to this one.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedSender {
    /// Sender id.
    pub server_id: ServerId,
    /// Token shared with the sender.
    pub token: String,
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub probe_interval_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter: true,
            probe_interval_ms: 60_000,
        }
    }
}

/// `[dispatch]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub batch_size: usize,
    pub attempt_timeout_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            attempt_timeout_ms: 30_000,
        }
    }
}

/// `[persistence]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub sync_on_write: bool,
    pub sequence_block: u64,
    pub compaction_threshold: u64,
    pub max_pending: usize,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            sequence_block: 1_000,
            compaction_threshold: 10_000,
            max_pending: 100_000,
        }
    }
}

/// `[receiver]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverSection {
    pub max_batch: usize,
    pub max_clock_skew_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Shared directory that `file.*` tasks write to.
    pub file_root: Option<PathBuf>,
    /// Object types this node does not apply.
    pub excluded_types: Vec<String>,
    /// Hours an idle watermark or version stamp is kept (0 = forever).
    pub version_retention_hours: u64,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            max_batch: 500,
            max_clock_skew_ms: 300_000,
            conflict_policy: ConflictPolicy::default(),
            file_root: None,
            excluded_types: Vec::new(),
            version_retention_hours: 7 * 24,
        }
    }
}

/// Contents of a node file.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// This node's id.
    pub server_id: ServerId,
    /// Directory holding the journal and lock file.
    pub data_dir: PathBuf,
    /// Address the apply endpoint listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Nodes allowed to send tasks here.
    #[serde(default)]
    pub trusted_senders: Vec<TrustedSender>,
    /// Nodes this one delivers to.
    #[serde(default)]
    pub targets: Vec<DeliveryTarget>,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub receiver: ReceiverSection,
}

impl NodeConfig {
    /// Loads and validates a node file.
    pub fn load(path: &Path) -> Result<Self, NodeConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| NodeConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), NodeConfigError> {
        if self.server_id.as_str().is_empty() {
            return Err(NodeConfigError::Invalid("server_id is empty".into()));
        }
        if let Some(own) = self.targets.iter().find(|t| t.server_id == self.server_id) {
            return Err(NodeConfigError::Invalid(format!(
                "node {} lists itself as a target",
                own.server_id
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(NodeConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Logger settings.
    pub fn core_config(&self) -> CoreConfig {
        let p = &self.persistence;
        CoreConfig::new(self.server_id.clone())
            .sync_on_write(p.sync_on_write)
            .sequence_block(p.sequence_block)
            .compaction_threshold(p.compaction_threshold)
            .max_pending(p.max_pending)
            .version_retention(self.version_retention())
    }

    /// Dispatcher settings.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let r = &self.retry;
        let retry = RetryConfig::new(r.max_retries)
            .with_initial_delay(Duration::from_millis(r.initial_delay_ms))
            .with_max_delay(Duration::from_millis(r.max_delay_ms))
            .with_backoff_multiplier(r.backoff_multiplier)
            .with_jitter(r.jitter)
            .with_probe_interval(Duration::from_millis(r.probe_interval_ms));
        DispatchConfig::new()
            .with_batch_size(self.dispatch.batch_size)
            .with_attempt_timeout(Duration::from_millis(self.dispatch.attempt_timeout_ms))
            .with_retry(retry)
    }

    fn version_retention(&self) -> Option<Duration> {
        match self.receiver.version_retention_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours * 60 * 60)),
        }
    }

    /// Receiver settings.
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.server_id.clone(), self.listen)
            .with_max_batch(self.receiver.max_batch)
            .with_max_clock_skew(Duration::from_millis(self.receiver.max_clock_skew_ms))
            .with_conflict_policy(self.receiver.conflict_policy)
            .with_version_retention(self.version_retention());
        for sender in &self.trusted_senders {
            config = config.with_trusted_sender(sender.server_id.clone(), sender.token.clone());
        }
        config
    }
}
