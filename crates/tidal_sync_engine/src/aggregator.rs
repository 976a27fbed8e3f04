//! Accumulation of watch changes into consistent remote events.
//!
//! The backend streams document and target changes one at a time. Only when
//! it reports a global snapshot version are the accumulated changes known to
//! be consistent; [`WatchChangeAggregator::create_remote_event`] then turns
//! them into a [`RemoteEvent`] and starts over.
//!
//! The aggregator does no I/O. Everything it needs to know about targets it
//! asks a [`TargetMetadataProvider`].

use std::collections::{BTreeMap, BTreeSet};
use tidal_sync_protocol::{
    DocumentChange, DocumentKey, ExistenceFilterChange, MaybeDocument, RemoteEvent, ResumeToken,
    SnapshotVersion, TargetChange, TargetData, TargetId, TargetStateChange,
    WatchTargetChangeState,
};
use tracing::{debug, trace};

/// Read access to target state kept outside the aggregator.
pub trait TargetMetadataProvider {
    /// Keys the sync layer currently holds for the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Descriptor of the target, if it is being listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Per-target accumulation between two consistent snapshots.
#[derive(Debug)]
struct TargetState {
    /// Watch and unwatch requests not yet acknowledged.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: ResumeToken,
    current: bool,
    /// New targets start with pending changes so their first snapshot is
    /// reported even if empty.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: ResumeToken::empty(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &ResumeToken) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert!(
            self.pending_responses >= 0,
            "target acknowledged more requests than were sent"
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }

    fn added_count(&self) -> usize {
        self.count(ChangeType::Added)
    }

    fn removed_count(&self) -> usize {
        self.count(ChangeType::Removed)
    }

    fn count(&self, change_type: ChangeType) -> usize {
        self.document_changes
            .values()
            .filter(|c| **c == change_type)
            .count()
    }
}

/// Accumulates watch changes until the next consistent snapshot.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a watch or unwatch request was sent for `target_id`.
    ///
    /// Until the backend acknowledges it, changes for the target are ignored.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    /// Returns true if requests for `target_id` are awaiting acknowledgement.
    pub fn is_pending(&self, target_id: TargetId) -> bool {
        self.target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending)
    }

    /// Forgets all state for `target_id`.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Applies a target state change.
    pub fn handle_target_change(
        &mut self,
        change: &TargetStateChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.target_ids_for(change, metadata) {
            let active = self.is_active_target(target_id, metadata);
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if active {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // Re-added targets start from scratch.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert!(
                        change.cause.is_none(),
                        "target removals with a cause must be handled before aggregation"
                    );
                }
                WatchTargetChangeState::Current => {
                    if active {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if active {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Applies a document change to every target it names.
    pub fn handle_document_change(
        &mut self,
        change: &DocumentChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc) if doc.exists() => self.add_document_to_target(*target_id, doc, metadata),
                other => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    other.clone(),
                    metadata,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &change.key,
                change.new_doc.clone(),
                metadata,
            );
        }
    }

    /// Checks the backend's document count for a target against ours.
    ///
    /// A mismatch resets the target and flags it in the next event so it can
    /// be re-listened from scratch.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let Some(target_data) = metadata.target_data_for_target(target_id) else {
            return;
        };

        if let Some(key) = target_data.query().document_key() {
            if change.count == 0 {
                // The document was deleted while we were not watching.
                let tombstone = MaybeDocument::no_document(key.clone(), SnapshotVersion::NONE);
                self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
            } else {
                hard_assert!(
                    change.count == 1,
                    "single document existence filter with count {}",
                    change.count
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count != change.count {
            debug!(
                target_id = %target_id,
                expected = change.count,
                actual = current_count,
                "Existence filter mismatch, resetting target"
            );
            self.reset_target(target_id, metadata);
            self.pending_target_resets.insert(target_id);
        }
    }

    /// Builds the event for `snapshot_version` and clears per-snapshot state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            if !self.is_active_target(target_id, metadata) {
                continue;
            }
            let document_key = metadata
                .target_data_for_target(target_id)
                .and_then(|data| data.query().document_key());
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            if let (true, Some(key)) = (current, document_key) {
                if !self.pending_document_updates.contains_key(&key)
                    && !self.target_contains_document(target_id, &key, metadata)
                {
                    // A current document target that never received its
                    // document is known not to exist at this version.
                    let tombstone = MaybeDocument::no_document(key.clone(), snapshot_version);
                    self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
        };
        trace!(
            version = %snapshot_version,
            targets = event.target_changes.len(),
            documents = event.document_updates.len(),
            "Created remote event"
        );
        event
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: &MaybeDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key, document.clone());
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MaybeDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        if self.target_contains_document(target_id, key, metadata) {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Never reported to the sync layer; just undo any in-batch add.
            self.ensure_target_state(target_id)
                .remove_document_change(key);
        }
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        hard_assert!(
            !self.is_pending(target_id),
            "cannot reset target {} with requests in flight",
            target_id
        );
        self.target_states.insert(target_id, TargetState::new());

        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let remote = metadata.remote_keys_for_target(target_id).len();
        match self.target_states.get(&target_id) {
            Some(state) => (remote + state.added_count()).saturating_sub(state.removed_count()),
            None => remote,
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        !self.is_pending(target_id) && metadata.target_data_for_target(target_id).is_some()
    }

    fn target_ids_for(
        &self,
        change: &TargetStateChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|id| self.is_active_target(*id, metadata))
            .collect()
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }
}
