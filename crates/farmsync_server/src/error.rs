//! Error types for the receiver.

use farmsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for receiver operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that reject a whole request.
///
/// Problems with individual tasks never surface here; they become nacks
/// in an otherwise successful response.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Signature headers missing, stale or wrong.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The sender is not a trusted node.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedProtocolVersion { .. } => {
                ServerError::ProtocolMismatch(err.to_string())
            }
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::ProtocolMismatch(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::ProtocolMismatch(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::Internal(_) | ServerError::Io(_) => 500,
        }
    }

    /// JSON body describing the error.
    pub fn to_body(&self) -> Vec<u8> {
        serde_json::json!({ "error": self.to_string() })
            .to_string()
            .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("x".into()).is_client_error());
        assert!(ServerError::AuthenticationFailed("x".into()).is_client_error());
        assert!(ServerError::NotAuthorized("x".into()).is_client_error());
        assert!(ServerError::Internal("x".into()).is_server_error());
        assert!(!ServerError::Internal("x".into()).is_client_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::AuthenticationFailed("x".into()).status_code(), 401);
        assert_eq!(ServerError::NotAuthorized("x".into()).status_code(), 403);
        assert_eq!(ServerError::ProtocolMismatch("x".into()).status_code(), 400);
        assert_eq!(ServerError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn protocol_version_maps_to_mismatch() {
        let err: ServerError = ProtocolError::UnsupportedProtocolVersion {
            got: 9,
            supported: 1,
        }
        .into();
        assert!(matches!(err, ServerError::ProtocolMismatch(_)));

        let err: ServerError = ProtocolError::invalid_payload("bad").into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[test]
    fn body_is_json() {
        let body = ServerError::NotAuthorized("node-x".into()).to_body();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "not authorized: node-x");
    }
}
