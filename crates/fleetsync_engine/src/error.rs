//! Error types for the sync engine.

use fleetsync_protocol::{CorrelationId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
///
/// None of these terminate the engine: transport errors drive reconnection,
/// decode errors drop one message, mutation errors reach only the caller
/// that issued the mutation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A single inbound message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// An optimistic mutation was not confirmed in time.
    #[error("mutation {correlation_id} was not confirmed in time")]
    MutationTimeout {
        /// Correlation id of the mutation.
        correlation_id: CorrelationId,
    },

    /// The backend refused a mutation.
    #[error("mutation {correlation_id} rejected: {reason}")]
    MutationRejected {
        /// Correlation id of the mutation.
        correlation_id: CorrelationId,
        /// Reason given by the backend.
        reason: String,
    },

    /// The connection was closed while a mutation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// Reconnect budget exhausted; the engine keeps retrying at the capped interval.
    #[error("backend unreachable after {attempts} consecutive attempts")]
    PersistentFailure {
        /// Consecutive failed attempts so far.
        attempts: u32,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Not connected.
    #[error("not connected to backend")]
    NotConnected,

    /// The engine loop has stopped.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
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

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            SyncError::PersistentFailure { .. } => true,
            _ => false,
        }
    }
}
