//! Error types for FarmSync core.

use farmsync_protocol::{SequenceId, ServerId, TaskKindId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] farmsync_storage::StorageError),

    /// Protocol encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] farmsync_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A task kind was registered twice.
    #[error("task kind already registered: {kind}")]
    DuplicateRegistration {
        /// The repeated kind id.
        kind: TaskKindId,
    },

    /// A task kind is not known to the registry.
    #[error("unknown task kind: {kind}")]
    UnknownKind {
        /// The unknown kind id.
        kind: TaskKindId,
    },

    /// A critical task could not be made durable.
    #[error("persistence failed for task {sequence_id}: {message}")]
    Persistence {
        /// Sequence id that was assigned to the lost task.
        sequence_id: SequenceId,
        /// Underlying failure.
        message: String,
    },

    /// The journal is corrupted or invalid.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Another process holds the node directory.
    #[error("node directory locked: another process has exclusive access")]
    NodeLocked,

    /// A delivery target is not configured.
    #[error("unknown delivery target: {target}")]
    UnknownTarget {
        /// The target server id.
        target: ServerId,
    },

    /// A delivery target was configured twice.
    #[error("delivery target already configured: {target}")]
    DuplicateTarget {
        /// The repeated server id.
        target: ServerId,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(sequence_id: SequenceId, message: impl Into<String>) -> Self {
        Self::Persistence {
            sequence_id,
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unknown target error.
    pub fn unknown_target(target: &ServerId) -> Self {
        Self::UnknownTarget {
            target: target.clone(),
        }
    }

    /// Returns true if this is a persistence failure of a critical task.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}
