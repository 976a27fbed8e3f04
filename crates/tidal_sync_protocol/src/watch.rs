//! Change notifications pushed by the watch stream.

use crate::document::{DocumentKey, MaybeDocument};
use crate::status::Status;
use crate::target::{ResumeToken, TargetId};
use serde::{Deserialize, Serialize};

/// State reported for a set of targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchTargetChangeState {
    /// Nothing changed; the message only carries a resume token.
    NoChange,
    /// The server acknowledged a watch request.
    Added,
    /// The server acknowledged an unwatch request, or dropped the target
    /// with a cause.
    Removed,
    /// The target's results are up to date as of the next snapshot.
    Current,
    /// The server will resend the target's results from scratch.
    Reset,
}

/// A document was added, changed or removed for some targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// Targets the document now matches.
    pub updated_target_ids: Vec<TargetId>,
    /// Targets the document no longer matches.
    pub removed_target_ids: Vec<TargetId>,
    /// Document key.
    pub key: DocumentKey,
    /// New document state, if the server sent one.
    pub new_doc: Option<MaybeDocument>,
}

/// The state of some targets changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStateChange {
    /// New state.
    pub state: WatchTargetChangeState,
    /// Targets affected; empty means every active target.
    pub target_ids: Vec<TargetId>,
    /// Resume token for the targets; may be empty.
    pub resume_token: ResumeToken,
    /// Why the targets were removed, for a per-target failure.
    pub cause: Option<Status>,
}

/// The server's count of documents matching a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceFilterChange {
    /// Target the count applies to.
    pub target_id: TargetId,
    /// Number of documents the server holds for the target.
    pub count: usize,
}

/// One notification received from the watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchChange {
    /// A document changed.
    Document(DocumentChange),
    /// Target states changed.
    Target(TargetStateChange),
    /// An existence filter arrived.
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Creates a target state change with no token or cause.
    pub fn target(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self::Target(TargetStateChange {
            state,
            target_ids,
            resume_token: ResumeToken::empty(),
            cause: None,
        })
    }

    /// Creates a target state change carrying a resume token.
    pub fn target_with_token(
        state: WatchTargetChangeState,
        target_ids: Vec<TargetId>,
        resume_token: ResumeToken,
    ) -> Self {
        Self::Target(TargetStateChange {
            state,
            target_ids,
            resume_token,
            cause: None,
        })
    }

    /// Creates a removal of targets caused by a server-side failure.
    pub fn target_removed_with_cause(target_ids: Vec<TargetId>, cause: Status) -> Self {
        Self::Target(TargetStateChange {
            state: WatchTargetChangeState::Removed,
            target_ids,
            resume_token: ResumeToken::empty(),
            cause: Some(cause),
        })
    }

    /// Creates a document change from a document state.
    pub fn document(
        updated_target_ids: Vec<TargetId>,
        removed_target_ids: Vec<TargetId>,
        doc: MaybeDocument,
    ) -> Self {
        Self::Document(DocumentChange {
            updated_target_ids,
            removed_target_ids,
            key: doc.key().clone(),
            new_doc: Some(doc),
        })
    }

    /// Creates an existence filter notification.
    pub fn existence_filter(target_id: TargetId, count: usize) -> Self {
        Self::ExistenceFilter(ExistenceFilterChange { target_id, count })
    }

    /// Returns the removal cause if this is a removal-with-cause.
    pub fn removal_cause(&self) -> Option<&Status> {
        match self {
            Self::Target(TargetStateChange {
                state: WatchTargetChangeState::Removed,
                cause: Some(cause),
                ..
            }) => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use crate::version::SnapshotVersion;

    #[test]
    fn removal_cause_only_for_removed_with_cause() {
        let ids = vec![TargetId::new(3)];
        let denied = Status::new(StatusCode::PermissionDenied, "denied");

        let change = WatchChange::target_removed_with_cause(ids.clone(), denied.clone());
        assert_eq!(change.removal_cause(), Some(&denied));

        let plain = WatchChange::target(WatchTargetChangeState::Removed, ids.clone());
        assert!(plain.removal_cause().is_none());

        let current = WatchChange::target(WatchTargetChangeState::Current, ids);
        assert!(current.removal_cause().is_none());
    }

    #[test]
    fn document_change_takes_key_from_doc() {
        let key = DocumentKey::parse("rooms/eros").unwrap();
        let doc = MaybeDocument::no_document(key.clone(), SnapshotVersion::from_micros(1));
        let WatchChange::Document(change) = WatchChange::document(vec![], vec![TargetId::new(1)], doc)
        else {
            panic!("expected a document change");
        };
        assert_eq!(change.key, key);
        assert!(change.new_doc.is_some());
    }
}
