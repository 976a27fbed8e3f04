//! Error types for the sync engine.
//!
//! Only recoverable conditions live here. Broken invariants go through
//! `hard_assert!` instead.

use thiserror::Error;
use tidal_sync_protocol::{ProtocolError, Status, StatusCode};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
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

    /// The backend reported a failure for a request or target.
    #[error("{code}: {message}")]
    Remote {
        /// Status code reported by the backend.
        code: StatusCode,
        /// Diagnostic message.
        message: String,
    },

    /// The local cache failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A protocol value could not be built.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client has been shut down.
    #[error("client has been shut down")]
    ShutDown,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
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

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Returns the status code, for errors reported by the backend.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            SyncError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Remote { code, .. } => code.is_transient(),
            _ => false,
        }
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        Self::Remote {
            code: status.code,
            message: status.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::from(Status::new(StatusCode::Unavailable, "")).is_retryable());
        assert!(!SyncError::from(Status::new(StatusCode::PermissionDenied, "")).is_retryable());
        assert!(!SyncError::ShutDown.is_retryable());
    }

    #[test]
    fn status_translation() {
        let err = SyncError::from(Status::new(StatusCode::PermissionDenied, "missing rule"));
        assert_eq!(err.code(), Some(StatusCode::PermissionDenied));
        assert_eq!(err.to_string(), "permission-denied: missing rule");
        assert_eq!(SyncError::Cancelled.code(), None);
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::ShutDown.to_string(), "client has been shut down");
        assert_eq!(
            SyncError::persistence("disk full").to_string(),
            "persistence error: disk full"
        );
    }
}
