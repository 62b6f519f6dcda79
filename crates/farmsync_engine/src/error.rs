//! Error types for the dispatch engine.
//!
//! Apart from [`EngineError::MissingDependency`] on the staging approve path
//! and administrative operations on unknown targets, none of these reach a
//! capture caller: a failed delivery attempt is counted, logged and retried.

use farmsync_core::CoreError;
use farmsync_protocol::{NackCode, ProtocolError, SequenceId, ServerId};
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while delivering or staging tasks.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The attempt did not finish in time.
    #[error("delivery attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The target answered with a non-success HTTP status.
    #[error("target rejected request with status {status}: {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body, if readable.
        message: String,
    },

    /// The target refused a task.
    #[error("task {sequence_id} nacked ({code:?}): {message}")]
    Nack {
        /// Refused task.
        sequence_id: SequenceId,
        /// Reason.
        code: NackCode,
        /// Detail from the target.
        message: String,
    },

    /// A staged object references an object the target does not know and
    /// no resolver can supply.
    #[error("missing dependency on {target}: {object_type} #{source_id}")]
    MissingDependency {
        /// Target server.
        target: ServerId,
        /// Type of the referenced object.
        object_type: String,
        /// Source-environment id of the referenced object.
        source_id: i64,
    },

    /// Dependencies kept producing further dependencies.
    #[error("dependency chain deeper than {depth}")]
    DependencyChain {
        /// Rounds attempted.
        depth: usize,
    },

    /// Wire format error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Queue or journal error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a later attempt can succeed without operator
    /// action.
    ///
    /// The dispatcher retries every failure; this only decides how loudly
    /// it is logged.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Timeout(_) => true,
            EngineError::Rejected { status, .. } => *status >= 500 || *status == 429,
            EngineError::Nack { code, .. } => {
                matches!(code, NackCode::HandlerFailed | NackCode::Blocked)
            }
            _ => false,
        }
    }
}
