//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope is not valid JSON for the expected shape.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The sender speaks a protocol version this node does not understand.
    #[error("unsupported protocol version {got} (supported: {supported})")]
    UnsupportedProtocolVersion {
        /// Version in the request.
        got: u16,
        /// Highest version this node speaks.
        supported: u16,
    },

    /// A payload does not follow its schema.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
