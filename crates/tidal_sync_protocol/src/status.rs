//! Status codes carried by stream closes and target removals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    /// Not an error.
    Ok,
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The client sent an invalid argument.
    InvalidArgument,
    /// The deadline expired before the operation completed.
    DeadlineExceeded,
    /// A requested entity was not found.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or resource was exhausted.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// The operation went past the valid range.
    OutOfRange,
    /// The operation is not implemented.
    Unimplemented,
    /// Internal server error.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// The request lacked valid credentials.
    Unauthenticated,
}

impl StatusCode {
    /// Returns the kebab-case name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid-argument",
            StatusCode::DeadlineExceeded => "deadline-exceeded",
            StatusCode::NotFound => "not-found",
            StatusCode::AlreadyExists => "already-exists",
            StatusCode::PermissionDenied => "permission-denied",
            StatusCode::ResourceExhausted => "resource-exhausted",
            StatusCode::FailedPrecondition => "failed-precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::OutOfRange => "out-of-range",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::DataLoss => "data-loss",
            StatusCode::Unauthenticated => "unauthenticated",
        }
    }

    /// Returns true for codes worth retrying the stream for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StatusCode::Unavailable
                | StatusCode::DeadlineExceeded
                | StatusCode::ResourceExhausted
                | StatusCode::Aborted
                | StatusCode::Internal
                | StatusCode::Unknown
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The code.
    pub code: StatusCode,
    /// Diagnostic message.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The OK status, used for a graceful stream stop.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Returns true if this is the OK status.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status() {
        assert!(Status::ok().is_ok());
        assert!(!Status::new(StatusCode::Unavailable, "down").is_ok());
    }

    #[test]
    fn display() {
        let status = Status::new(StatusCode::PermissionDenied, "no access");
        assert_eq!(status.to_string(), "permission-denied: no access");
        assert_eq!(Status::ok().to_string(), "ok");
    }

    #[test]
    fn transient_codes() {
        assert!(StatusCode::Unavailable.is_transient());
        assert!(!StatusCode::PermissionDenied.is_transient());
        assert!(!StatusCode::Ok.is_transient());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&StatusCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission-denied\"");
    }
}
