//! Orchestration of the watch stream.
//!
//! [`RemoteStore`] owns the set of targets the client listens to and keeps
//! the watch stream running while there is something to watch. Changes from
//! the stream are fed to a [`WatchChangeAggregator`]; whenever the backend
//! marks a consistent snapshot the resulting [`RemoteEvent`] is handed to the
//! [`RemoteSyncer`].
//!
//! The store is a plain synchronous state machine. It is driven by the
//! client's serialized context, one call at a time.

use crate::aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::config::OnlineStateConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::User;
use crate::online_state::{OnlineState, OnlineStateTracker};
use crate::persistence::LocalStore;
use crate::timer::Scheduler;
use crate::transport::{StreamEvent, WatchStream};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tidal_sync_protocol::{
    DocumentKey, QueryPurpose, RemoteEvent, ResumeToken, SnapshotVersion, Status, TargetData,
    TargetId, WatchChange,
};
use tracing::{debug, trace, warn};

/// The layer above the remote store that applies events to local state.
pub trait RemoteSyncer: Send {
    /// Applies a consistent remote event.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()>;

    /// Reports that the backend rejected a listen.
    fn reject_listen(&mut self, target_id: TargetId, error: SyncError);

    /// Reports a connectivity change.
    fn handle_online_state_change(&mut self, online_state: OnlineState);

    /// Reports that the signed-in user changed.
    fn handle_user_change(&mut self, user: User);

    /// Keys the sync layer holds for a target as of the last event.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;
}

/// Decides whether this client may use the network at all.
pub trait NetworkPolicy: Send {
    /// Returns true if the network may be used.
    fn allows_network(&self) -> bool;
}

/// Policy for a client that is the only one using its cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl NetworkPolicy for SingleProcess {
    fn allows_network(&self) -> bool {
        true
    }
}

/// Looks up target metadata from the listen set and the sync layer.
struct ListenTargetMetadata<'a, S> {
    listen_targets: &'a BTreeMap<TargetId, Arc<TargetData>>,
    syncer: &'a S,
}

impl<S: RemoteSyncer> TargetMetadataProvider for ListenTargetMetadata<'_, S> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id).map(Arc::as_ref)
    }
}

/// Keeps the watch stream in line with the set of listened targets.
pub struct RemoteStore<W, S, L: ?Sized> {
    watch_stream: W,
    syncer: S,
    local_store: Arc<L>,
    scheduler: Arc<dyn Scheduler>,
    listen_targets: BTreeMap<TargetId, Arc<TargetData>>,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    online_state_tracker: OnlineStateTracker,
    network_enabled: bool,
    network_policy: Box<dyn NetworkPolicy>,
}

impl<W, S, L> RemoteStore<W, S, L>
where
    W: WatchStream,
    S: RemoteSyncer,
    L: LocalStore + ?Sized,
{
    /// Creates a store with the network enabled and nothing listened to.
    pub fn new(
        watch_stream: W,
        syncer: S,
        local_store: Arc<L>,
        scheduler: Arc<dyn Scheduler>,
        config: OnlineStateConfig,
    ) -> Self {
        Self {
            watch_stream,
            syncer,
            local_store,
            scheduler,
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            online_state_tracker: OnlineStateTracker::new(config),
            network_enabled: true,
            network_policy: Box::new(SingleProcess),
        }
    }

    /// Replaces the network policy.
    pub fn with_network_policy(mut self, policy: impl NetworkPolicy + 'static) -> Self {
        self.network_policy = Box::new(policy);
        self
    }

    /// Starts watching a target.
    ///
    /// # Panics
    ///
    /// Panics if the target is already being listened to.
    pub fn listen(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id();
        hard_assert!(
            !self.listen_targets.contains_key(&target_id),
            "listen called with duplicate target id {}",
            target_id
        );
        debug!(
            target_id = %target_id,
            query = %target_data.query().canonical_id(),
            "Listening to target"
        );

        let target_data = Arc::new(target_data);
        self.listen_targets
            .insert(target_id, Arc::clone(&target_data));

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&target_data);
        }
    }

    /// Stops watching a target.
    ///
    /// # Panics
    ///
    /// Panics if the target is not being listened to.
    pub fn unlisten(&mut self, target_id: TargetId) {
        hard_assert!(
            self.listen_targets.remove(&target_id).is_some(),
            "unlisten called on target {} that is not being listened to",
            target_id
        );
        debug!(target_id = %target_id, "Stopped listening to target");

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }

        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                // Keep the connection warm; the stream may close itself.
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Nothing to watch and no connection attempt in flight.
                self.set_online_state(OnlineState::Unknown);
            }
        }
    }

    /// Handles an event from the watch stream.
    pub fn handle_stream_event(&mut self, event: StreamEvent) {
        if !self.watch_stream.accept(&event) {
            trace!(connection = event.connection(), "Dropping event from a stopped connection");
            return;
        }
        match event {
            StreamEvent::Open { .. } => self.on_watch_stream_open(),
            StreamEvent::Change {
                change,
                snapshot_version,
                ..
            } => self.on_watch_stream_change(change, snapshot_version),
            StreamEvent::Close { status, .. } => self.on_watch_stream_close(status),
        }
    }

    /// Enables or disables network use.
    ///
    /// Disabling reports Unknown connectivity. Neither direction starts or
    /// stops the stream; the next listen or stream event does.
    pub fn set_network_enabled(&mut self, enabled: bool) {
        debug!(enabled, "Setting network enabled");
        self.network_enabled = enabled;
        if !enabled {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    /// Handles expiry of the connection attempt timeout.
    pub fn handle_online_state_timeout(&mut self) {
        let change = self.online_state_tracker.handle_online_state_timeout();
        self.publish_online_state(change);
    }

    /// Handles a change of the signed-in user.
    ///
    /// A running stream is restarted so the next connection carries the new
    /// credentials.
    pub fn handle_credential_change(&mut self, user: User) {
        debug!(user = %user, "Credentials changed");
        let restart = self.watch_stream.is_started();
        if restart {
            self.watch_stream.stop();
            self.watch_change_aggregator = None;
            self.set_online_state(OnlineState::Unknown);
        }
        self.syncer.handle_user_change(user);
        if restart && self.should_start_watch_stream() {
            self.start_watch_stream();
        }
    }

    /// Stops the stream and all timers.
    pub fn shutdown(&mut self) {
        debug!("Shutting down remote store");
        self.network_enabled = false;
        if self.watch_stream.is_started() {
            self.watch_stream.stop();
        }
        self.watch_change_aggregator = None;
        self.online_state_tracker.shutdown();
        self.set_online_state(OnlineState::Unknown);
    }

    /// Returns true if the stream should be started now.
    pub fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && !self.watch_stream.is_started()
            && !self.listen_targets.is_empty()
    }

    /// Returns true if the network may be used.
    pub fn can_use_network(&self) -> bool {
        self.network_enabled && self.network_policy.allows_network()
    }

    /// Returns true if network use is enabled.
    pub fn is_network_enabled(&self) -> bool {
        self.network_enabled
    }

    /// Returns the current connectivity state.
    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    /// Returns the descriptor for a listened target.
    pub fn listen_target(&self, target_id: TargetId) -> Option<Arc<TargetData>> {
        self.listen_targets.get(&target_id).cloned()
    }

    /// Returns the ids of all listened targets.
    pub fn active_target_ids(&self) -> Vec<TargetId> {
        self.listen_targets.keys().copied().collect()
    }

    /// Returns the watch stream.
    pub fn watch_stream(&self) -> &W {
        &self.watch_stream
    }

    /// Returns the watch stream mutably.
    pub fn watch_stream_mut(&mut self) -> &mut W {
        &mut self.watch_stream
    }

    /// Returns the sync layer.
    pub fn syncer(&self) -> &S {
        &self.syncer
    }

    /// Returns the sync layer mutably.
    pub fn syncer_mut(&mut self) -> &mut S {
        &mut self.syncer
    }

    fn start_watch_stream(&mut self) {
        hard_assert!(
            self.should_start_watch_stream(),
            "start_watch_stream called when should_start_watch_stream is false"
        );
        debug!(targets = self.listen_targets.len(), "Starting watch stream");
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state_tracker
            .handle_watch_stream_start(self.scheduler.as_ref());
    }

    fn send_watch_request(&mut self, target_data: &TargetData) {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            fail!("watch request sent without an aggregator");
        };
        aggregator.record_pending_target_request(target_data.target_id());
        self.watch_stream.watch(target_data);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            fail!("unwatch request sent without an aggregator");
        };
        aggregator.record_pending_target_request(target_id);
        self.watch_stream.unwatch(target_id);
    }

    fn on_watch_stream_open(&mut self) {
        debug!(targets = self.listen_targets.len(), "Watch stream open");
        let targets: Vec<Arc<TargetData>> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&target_data);
        }
    }

    fn on_watch_stream_change(&mut self, change: WatchChange, snapshot_version: SnapshotVersion) {
        // Any message proves the connection works.
        self.set_online_state(OnlineState::Online);

        if let (WatchChange::Target(target_change), Some(cause)) = (&change, change.removal_cause()) {
            self.handle_target_error(&target_change.target_ids, cause);
            return;
        }

        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            fail!("watch change received without an aggregator");
        };
        let metadata = ListenTargetMetadata {
            listen_targets: &self.listen_targets,
            syncer: &self.syncer,
        };
        match &change {
            WatchChange::Document(c) => aggregator.handle_document_change(c, &metadata),
            WatchChange::Target(c) => aggregator.handle_target_change(c, &metadata),
            WatchChange::ExistenceFilter(c) => aggregator.handle_existence_filter(c, &metadata),
        }

        if snapshot_version.is_none() {
            return;
        }
        let last_remote_snapshot_version = self.local_store.last_remote_snapshot_version();
        if snapshot_version >= last_remote_snapshot_version {
            self.raise_watch_snapshot(snapshot_version);
        } else {
            debug!(
                version = %snapshot_version,
                last = %last_remote_snapshot_version,
                "Suppressing snapshot older than the cache"
            );
        }
    }

    fn handle_target_error(&mut self, target_ids: &[TargetId], cause: &Status) {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_none() {
                continue;
            }
            if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            warn!(target_id = %target_id, cause = %cause, "Listen rejected by backend");
            self.syncer
                .reject_listen(*target_id, SyncError::from(cause.clone()));
        }
    }

    fn raise_watch_snapshot(&mut self, snapshot_version: SnapshotVersion) {
        hard_assert!(
            !snapshot_version.is_none(),
            "cannot raise a snapshot without a version"
        );
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            fail!("snapshot raised without an aggregator");
        };
        let metadata = ListenTargetMetadata {
            listen_targets: &self.listen_targets,
            syncer: &self.syncer,
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get(target_id) {
                let updated =
                    target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                self.listen_targets.insert(*target_id, Arc::new(updated));
            }
        }

        for target_id in &event.target_mismatches {
            // The target may have been unlistened since.
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Clear the token so the next watch gets the full result set.
            let cleared =
                target_data.with_resume_token(ResumeToken::empty(), target_data.snapshot_version());
            self.listen_targets.insert(*target_id, Arc::new(cleared));

            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.query().clone(),
                *target_id,
                QueryPurpose::ExistenceFilterMismatch,
                target_data.sequence_number(),
            );
            self.send_watch_request(&request);
        }

        trace!(
            version = %snapshot_version,
            targets = event.target_changes.len(),
            documents = event.document_updates.len(),
            "Raising remote event"
        );
        if let Err(err) = self.syncer.apply_remote_event(event) {
            warn!(version = %snapshot_version, error = %err, "Failed to apply remote event");
        }
    }

    fn on_watch_stream_close(&mut self, status: Status) {
        if status.is_ok() {
            hard_assert!(
                !self.should_start_watch_stream(),
                "watch stream was stopped gracefully while still needed"
            );
        }
        debug!(status = %status, "Watch stream closed");
        self.watch_change_aggregator = None;

        if self.should_start_watch_stream() {
            let change = self.online_state_tracker.handle_watch_stream_failure(&status);
            self.publish_online_state(change);
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    fn set_online_state(&mut self, state: OnlineState) {
        let change = self.online_state_tracker.set(state);
        self.publish_online_state(change);
    }

    fn publish_online_state(&mut self, change: Option<OnlineState>) {
        if let Some(state) = change {
            self.syncer.handle_online_state_change(state);
        }
    }
}
