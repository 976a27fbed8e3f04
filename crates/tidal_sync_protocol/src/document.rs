//! Document keys and cached document states.

use crate::error::{ProtocolError, ProtocolResult};
use crate::version::SnapshotVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Slash-separated path naming a document, e.g. `rooms/eros/messages/1`.
///
/// A key always has an even number of segments: collection id followed by
/// document id, repeated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Parses a document key from its path form.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let segments = split_path(path)?;
        if segments.len() % 2 != 0 {
            return Err(ProtocolError::InvalidDocumentKey(path.to_string()));
        }
        Ok(Self(segments.join("/")))
    }

    /// Returns the key's path.
    pub fn path(&self) -> &str {
        &self.0
    }

    /// Returns the collection path that contains this document.
    pub fn collection_path(&self) -> &str {
        self.0.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
    }

    /// Returns the last path segment (the document id).
    pub fn document_id(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, id)| id).unwrap_or(&self.0)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Splits a resource path into non-empty segments.
pub(crate) fn split_path(path: &str) -> ProtocolResult<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(ProtocolError::invalid_path(path, "path is empty"));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ProtocolError::invalid_path(path, "empty segment"));
    }
    Ok(segments)
}

/// The state of one document as known to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaybeDocument {
    /// The document exists with the given contents.
    Document {
        /// Document key.
        key: DocumentKey,
        /// Version at which these contents were written.
        version: SnapshotVersion,
        /// Document fields.
        data: serde_json::Value,
    },
    /// The document is known not to exist at `version` (a tombstone).
    NoDocument {
        /// Document key.
        key: DocumentKey,
        /// Version at which the document was observed missing.
        version: SnapshotVersion,
    },
}

impl MaybeDocument {
    /// Creates an existing document.
    pub fn document(key: DocumentKey, version: SnapshotVersion, data: serde_json::Value) -> Self {
        Self::Document { key, version, data }
    }

    /// Creates a tombstone.
    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::NoDocument { key, version }
    }

    /// Returns the document key.
    pub fn key(&self) -> &DocumentKey {
        match self {
            Self::Document { key, .. } | Self::NoDocument { key, .. } => key,
        }
    }

    /// Returns the version of this state.
    pub fn version(&self) -> SnapshotVersion {
        match self {
            Self::Document { version, .. } | Self::NoDocument { version, .. } => *version,
        }
    }

    /// Returns true if the document exists.
    pub fn exists(&self) -> bool {
        matches!(self, Self::Document { .. })
    }

    /// Returns the document data, if it exists.
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Document { data, .. } => Some(data),
            Self::NoDocument { .. } => None,
        }
    }
}
