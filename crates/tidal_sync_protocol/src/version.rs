//! Snapshot versions and listen sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the server's commit history, in microseconds.
///
/// Versions are totally ordered. [`SnapshotVersion::NONE`] is the sentinel
/// carried by watch messages that do not close a consistent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SnapshotVersion(i64);

impl SnapshotVersion {
    /// The "no version" sentinel.
    pub const NONE: SnapshotVersion = SnapshotVersion(0);

    /// Creates a version from a microsecond timestamp.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns the version as microseconds.
    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    /// Returns true if this is the [`SnapshotVersion::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Sequence number recorded whenever a target or document is used.
///
/// Lower numbers were used longer ago and are evicted first.
pub type ListenSequenceNumber = i64;

/// Sequence number value meaning "not yet assigned".
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_smallest() {
        assert!(SnapshotVersion::NONE < SnapshotVersion::from_micros(1));
        assert!(SnapshotVersion::NONE.is_none());
        assert!(!SnapshotVersion::from_micros(1).is_none());
        assert_eq!(SnapshotVersion::default(), SnapshotVersion::NONE);
    }

    #[test]
    fn display() {
        assert_eq!(SnapshotVersion::from_micros(42).to_string(), "v42");
    }
}
