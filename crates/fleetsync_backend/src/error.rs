//! Error types for the reference backend.

use fleetsync_protocol::{EntityKind, ProtocolError};
use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur in the backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch {
        /// Version the backend speaks.
        expected: u16,
        /// Version the client sent.
        actual: u16,
    },

    /// The target entity does not exist.
    #[error("unknown {kind} {id}")]
    UnknownEntity {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: String,
    },

    /// Frame encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Returns true if the client caused this error.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, BackendError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(BackendError::InvalidRequest("bad".into()).is_client_error());
        assert!(BackendError::AuthenticationFailed("no token".into()).is_client_error());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!BackendError::Io(io).is_client_error());
    }

    #[test]
    fn error_display() {
        let err = BackendError::ProtocolMismatch {
            expected: 1,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('3'));

        let err = BackendError::UnknownEntity {
            kind: EntityKind::Cluster,
            id: "eu-west".into(),
        };
        assert_eq!(err.to_string(), "unknown cluster eu-west");
    }
}
