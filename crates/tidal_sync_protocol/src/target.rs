//! Queries and the target descriptors that subscribe to them.

use crate::document::{split_path, DocumentKey};
use crate::error::ProtocolResult;
use crate::version::{ListenSequenceNumber, SnapshotVersion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer handle naming one server-side query subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(i32);

impl TargetId {
    /// Creates a target id.
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn get(&self) -> i32 {
        self.0
    }
}

impl From<i32> for TargetId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque server-issued position for resuming a watch.
///
/// An empty token means "no position": the server sends the full result
/// set again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    /// Returns the empty token.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Returns true if the token carries no position.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for ResumeToken {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for ResumeToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static str> for ResumeToken {
    fn from(token: &'static str) -> Self {
        Self(Bytes::from_static(token.as_bytes()))
    }
}

/// Comparison operator of a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// `field == value`
    Equal,
    /// `field < value`
    LessThan,
    /// `field <= value`
    LessThanOrEqual,
    /// `field > value`
    GreaterThan,
    /// `field >= value`
    GreaterThanOrEqual,
    /// `value in field` for array fields.
    ArrayContains,
}

impl FilterOp {
    fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Equal => "==",
            FilterOp::LessThan => "<",
            FilterOp::LessThanOrEqual => "<=",
            FilterOp::GreaterThan => ">",
            FilterOp::GreaterThanOrEqual => ">=",
            FilterOp::ArrayContains => "array_contains",
        }
    }
}

/// A single field filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field path.
    pub field: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: serde_json::Value,
}

/// The definition of a listened query.
///
/// Only the shape needed to name and re-send a target is modelled; query
/// execution happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: String,
    filters: Vec<Filter>,
    limit: Option<u32>,
}

impl Query {
    /// Creates a query over the collection or document at `path`.
    pub fn at_path(path: &str) -> ProtocolResult<Self> {
        let segments = split_path(path)?;
        Ok(Self {
            path: segments.join("/"),
            filters: Vec::new(),
            limit: None,
        })
    }

    /// Adds a filter.
    pub fn with_filter(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: serde_json::Value,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns the resource path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the filters.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns the limit, if any.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Returns true if this query targets exactly one document.
    pub fn is_document_query(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.path.split('/').count() % 2 == 0
    }

    /// Returns the key of the single document this query targets.
    pub fn document_key(&self) -> Option<DocumentKey> {
        if self.is_document_query() {
            DocumentKey::parse(&self.path).ok()
        } else {
            None
        }
    }

    /// Returns a stable string identifying this query.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.clone();
        for filter in &self.filters {
            id.push_str(&format!("|f:{}{}{}", filter.field, filter.op.symbol(), filter.value));
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{}", limit));
        }
        id
    }
}

/// Why a target is being listened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPurpose {
    /// A regular listen issued by the application.
    Listen,
    /// A one-off relisten after the server reported a different document
    /// count than the client holds.
    ExistenceFilterMismatch,
}

/// Immutable descriptor of one active watch target.
///
/// Descriptors are never changed in place. The `with_*` methods return a new
/// value so that a holder of the previous descriptor keeps a consistent view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    query: Query,
    target_id: TargetId,
    purpose: QueryPurpose,
    sequence_number: ListenSequenceNumber,
    snapshot_version: SnapshotVersion,
    resume_token: ResumeToken,
}

impl TargetData {
    /// Creates a descriptor with no snapshot version and no resume token.
    pub fn new(
        query: Query,
        target_id: TargetId,
        purpose: QueryPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            query,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::NONE,
            resume_token: ResumeToken::empty(),
        }
    }

    /// Returns the query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns the target id.
    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    /// Returns the purpose.
    pub fn purpose(&self) -> QueryPurpose {
        self.purpose
    }

    /// Returns the listen sequence number used for eviction ranking.
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Returns the last snapshot version this target was consistent at.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    /// Returns the resume token.
    pub fn resume_token(&self) -> &ResumeToken {
        &self.resume_token
    }

    /// Returns a copy with a new resume token and snapshot version.
    pub fn with_resume_token(&self, resume_token: ResumeToken, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    /// Returns a copy with a different purpose.
    pub fn with_purpose(&self, purpose: QueryPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }

    /// Returns a copy with a different sequence number.
    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }
}
