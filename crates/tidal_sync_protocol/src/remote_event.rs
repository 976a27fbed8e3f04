//! Consistent snapshot events produced from accumulated watch changes.

use crate::document::{DocumentKey, MaybeDocument};
use crate::target::{ResumeToken, TargetId};
use crate::version::SnapshotVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Changes to one target's result set since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetChange {
    /// Latest resume token for the target; may be empty.
    pub resume_token: ResumeToken,
    /// Whether the target is caught up as of this snapshot.
    pub current: bool,
    /// Keys that entered the result set.
    pub added_documents: BTreeSet<DocumentKey>,
    /// Keys that stayed in the result set but changed.
    pub modified_documents: BTreeSet<DocumentKey>,
    /// Keys that left the result set.
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Returns true if no document moved.
    pub fn has_no_document_changes(&self) -> bool {
        self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty()
    }
}

/// Everything the watch stream said between two snapshot boundaries.
///
/// Built once per boundary and moved to the sync layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Version all of these changes are consistent at.
    pub snapshot_version: SnapshotVersion,
    /// Per-target deltas.
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match and must be resynced.
    pub target_mismatches: BTreeSet<TargetId>,
    /// Latest state of every touched document.
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
}

impl RemoteEvent {
    /// Returns every document key touched by this event.
    pub fn touched_keys(&self) -> BTreeSet<DocumentKey> {
        let mut keys: BTreeSet<DocumentKey> = self.document_updates.keys().cloned().collect();
        for change in self.target_changes.values() {
            keys.extend(change.added_documents.iter().cloned());
            keys.extend(change.modified_documents.iter().cloned());
            keys.extend(change.removed_documents.iter().cloned());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn touched_keys_merges_updates_and_deltas() {
        let mut change = TargetChange::default();
        change.added_documents.insert(key("rooms/a"));
        change.removed_documents.insert(key("rooms/b"));

        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(5),
            ..Default::default()
        };
        event.target_changes.insert(TargetId::new(1), change);
        event.document_updates.insert(
            key("rooms/c"),
            MaybeDocument::no_document(key("rooms/c"), SnapshotVersion::from_micros(5)),
        );

        let touched: Vec<String> = event.touched_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(touched, vec!["rooms/a", "rooms/b", "rooms/c"]);
    }

    #[test]
    fn empty_target_change() {
        assert!(TargetChange::default().has_no_document_changes());
    }
}
