//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol value construction.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building protocol values from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A resource path was empty or contained an empty segment.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A document key did not have an even number of segments.
    #[error("invalid document key {0:?}: expected an even number of segments")]
    InvalidDocumentKey(String),
}

impl ProtocolError {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }
}
