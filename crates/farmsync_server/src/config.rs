//! Receiver configuration.

use farmsync_core::DEFAULT_VERSION_RETENTION;
use farmsync_protocol::{ConflictPolicy, ServerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the apply endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Id of this node, reported by the health endpoint.
    pub server_id: ServerId,
    /// Maximum number of tasks accepted in one request.
    pub max_batch: usize,
    /// Whether requests must carry a valid signature.
    pub require_auth: bool,
    /// Shared tokens of the nodes allowed to send tasks.
    pub trusted_senders: HashMap<ServerId, String>,
    /// How far a request timestamp may drift from local time.
    pub max_clock_skew: Duration,
    /// Strategy for concurrent edits from different origins.
    pub conflict_policy: ConflictPolicy,
    /// How long idle watermarks and version stamps are kept (`None` = forever).
    pub version_retention: Option<Duration>,
}

impl ServerConfig {
    /// Creates a configuration for `server_id` listening on `bind_addr`.
    pub fn new(server_id: impl Into<ServerId>, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            server_id: server_id.into(),
            max_batch: 500,
            require_auth: true,
            trusted_senders: HashMap::new(),
            max_clock_skew: Duration::from_secs(300),
            conflict_policy: ConflictPolicy::default(),
            version_retention: Some(DEFAULT_VERSION_RETENTION),
        }
    }

    /// Trusts a sending node with its shared token.
    pub fn with_trusted_sender(mut self, origin: impl Into<ServerId>, token: impl Into<String>) -> Self {
        self.trusted_senders.insert(origin.into(), token.into());
        self
    }

    /// Sets the maximum number of tasks per request.
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }

    /// Sets the accepted clock skew.
    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets how long idle watermarks and version stamps are kept.
    pub fn with_version_retention(mut self, retention: Option<Duration>) -> Self {
        self.version_retention = retention;
        self
    }

    /// Accepts unsigned requests. Only meant for tests and closed networks.
    pub fn without_auth(mut self) -> Self {
        self.require_auth = false;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("localhost", SocketAddr::from(([127, 0, 0, 1], 8640)))
    }
}
