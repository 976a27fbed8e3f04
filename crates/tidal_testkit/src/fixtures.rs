//! Test fixtures and sync layer helpers.
//!
//! Provides value constructors for targets and documents, a recording
//! [`RemoteSyncer`], and a harness that drives a [`RemoteStore`] by hand.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tidal_sync_engine::{
    LocalStore, ManualScheduler, MemoryPersistence, MockWatchStream, OnlineState,
    OnlineStateConfig, RemoteStore, RemoteSyncer, SyncError, SyncResult, TimerId, User,
    WatchStream,
};
use tidal_sync_protocol::{
    DocumentKey, MaybeDocument, Query, QueryPurpose, RemoteEvent, SnapshotVersion, Status,
    TargetData, TargetId, WatchChange, WatchTargetChangeState,
};

/// Creates a listen target for the collection or document at `path`.
///
/// # Panics
///
/// Panics if `path` is not a valid path.
pub fn target(id: i32, path: &str) -> TargetData {
    TargetData::new(
        Query::at_path(path).expect("Invalid query path"),
        TargetId::new(id),
        QueryPurpose::Listen,
        1,
    )
}

/// Parses a document key.
///
/// # Panics
///
/// Panics if `path` is not a document path.
pub fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).expect("Invalid document path")
}

/// Creates an existing document at `path`.
pub fn doc(path: &str, version: i64, data: serde_json::Value) -> MaybeDocument {
    MaybeDocument::document(key(path), SnapshotVersion::from_micros(version), data)
}

/// Creates a tombstone at `path`.
pub fn deleted(path: &str, version: i64) -> MaybeDocument {
    MaybeDocument::no_document(key(path), SnapshotVersion::from_micros(version))
}

/// Everything a [`RecordingSyncer`] was told.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Applied remote events, in order.
    pub events: Vec<RemoteEvent>,
    /// Rejected listens, in order.
    pub rejections: Vec<(TargetId, SyncError)>,
    /// Published online states, in order.
    pub online_states: Vec<OnlineState>,
    /// User changes, in order.
    pub users: Vec<User>,
}

/// Shared view of a [`RecordingSyncer`]'s log.
///
/// Stays valid after the syncer has been moved into a client.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandle {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingHandle {
    /// Returns a copy of the log.
    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().clone()
    }

    /// Returns the applied events.
    pub fn events(&self) -> Vec<RemoteEvent> {
        self.inner.lock().events.clone()
    }

    /// Returns the rejected listens.
    pub fn rejections(&self) -> Vec<(TargetId, SyncError)> {
        self.inner.lock().rejections.clone()
    }

    /// Returns the published online states.
    pub fn online_states(&self) -> Vec<OnlineState> {
        self.inner.lock().online_states.clone()
    }

    /// Returns the most recently published online state.
    pub fn last_online_state(&self) -> Option<OnlineState> {
        self.inner.lock().online_states.last().copied()
    }

    /// Returns the reported user changes.
    pub fn users(&self) -> Vec<User> {
        self.inner.lock().users.clone()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        *self.inner.lock() = Recorded::default();
    }
}

/// A sync layer that records every call.
///
/// Remote keys are tracked from applied events. With a persistence attached,
/// events are also written to it and keys are read back from it.
#[derive(Debug, Default)]
pub struct RecordingSyncer {
    handle: RecordingHandle,
    persistence: Option<Arc<MemoryPersistence>>,
    remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    fail_apply: bool,
}

impl RecordingSyncer {
    /// Creates a syncer with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a syncer that also applies events to `persistence`.
    pub fn with_persistence(persistence: Arc<MemoryPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::default()
        }
    }

    /// Makes every later `apply_remote_event` fail.
    pub fn fail_apply(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    /// Switches failing `apply_remote_event` on or off.
    pub fn set_fail_apply(&mut self, fail: bool) {
        self.fail_apply = fail;
    }

    /// Returns a handle to the log.
    pub fn handle(&self) -> RecordingHandle {
        self.handle.clone()
    }
}

impl RemoteSyncer for RecordingSyncer {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()> {
        if self.fail_apply {
            return Err(SyncError::persistence("apply rejected by test"));
        }
        if let Some(persistence) = &self.persistence {
            persistence.apply_remote_event(&event)?;
        }
        for (target_id, change) in &event.target_changes {
            let keys = self.remote_keys.entry(*target_id).or_default();
            keys.extend(change.added_documents.iter().cloned());
            for removed in &change.removed_documents {
                keys.remove(removed);
            }
        }
        for target_id in &event.target_mismatches {
            self.remote_keys.remove(target_id);
        }
        self.handle.inner.lock().events.push(event);
        Ok(())
    }

    fn reject_listen(&mut self, target_id: TargetId, error: SyncError) {
        self.handle.inner.lock().rejections.push((target_id, error));
    }

    fn handle_online_state_change(&mut self, online_state: OnlineState) {
        self.handle.inner.lock().online_states.push(online_state);
    }

    fn handle_user_change(&mut self, user: User) {
        self.handle.inner.lock().users.push(user);
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        match &self.persistence {
            Some(persistence) => persistence.remote_keys_for_target(target_id),
            None => self.remote_keys.get(&target_id).cloned().unwrap_or_default(),
        }
    }
}

/// A local store whose last remote version is set by the test.
#[derive(Debug, Default)]
pub struct TestLocalStore {
    version: Mutex<SnapshotVersion>,
}

impl TestLocalStore {
    /// Sets the last remote snapshot version.
    pub fn set_version(&self, micros: i64) {
        *self.version.lock() = SnapshotVersion::from_micros(micros);
    }
}

impl LocalStore for TestLocalStore {
    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        *self.version.lock()
    }
}

/// Store type driven by [`StoreHarness`].
pub type HarnessStore = RemoteStore<MockWatchStream, RecordingSyncer, TestLocalStore>;

/// Drives a [`RemoteStore`] over a [`MockWatchStream`] and manual timers.
pub struct StoreHarness {
    /// The store under test.
    pub store: HarnessStore,
    /// Log of the store's syncer.
    pub recorded: RecordingHandle,
    /// The store's local store.
    pub local_store: Arc<TestLocalStore>,
    /// The store's timers.
    pub timers: ManualScheduler,
}

impl StoreHarness {
    /// Creates a harness with the default online state configuration.
    pub fn new() -> Self {
        Self::with_config(OnlineStateConfig::default())
    }

    /// Creates a harness with the given online state configuration.
    pub fn with_config(config: OnlineStateConfig) -> Self {
        let syncer = RecordingSyncer::new();
        let recorded = syncer.handle();
        let local_store = Arc::new(TestLocalStore::default());
        let timers = ManualScheduler::new();
        let store = RemoteStore::new(
            MockWatchStream::new(),
            syncer,
            Arc::clone(&local_store),
            Arc::new(timers.clone()),
            config,
        );
        Self {
            store,
            recorded,
            local_store,
            timers,
        }
    }

    /// Returns the mock stream.
    pub fn stream(&self) -> &MockWatchStream {
        self.store.watch_stream()
    }

    /// Delivers an open event on the current connection.
    pub fn open(&mut self) {
        let event = self.stream().open_event();
        self.store.handle_stream_event(event);
    }

    /// Delivers a change at `version` (0 for none) on the current connection.
    pub fn change(&mut self, change: WatchChange, version: i64) {
        let event = self
            .stream()
            .change_event(change, SnapshotVersion::from_micros(version));
        self.store.handle_stream_event(event);
    }

    /// Delivers a close on the current connection.
    pub fn close(&mut self, status: Status) {
        let event = self.stream().close_event(status);
        self.store.handle_stream_event(event);
    }

    /// Listens to `path` as target `id`, opening the stream if needed, and
    /// acknowledges the target.
    pub fn listen_acked(&mut self, id: i32, path: &str) {
        self.store.listen(target(id, path));
        if !self.stream().is_open() {
            self.open();
        }
        self.change(
            WatchChange::target(WatchTargetChangeState::Added, vec![TargetId::new(id)]),
            0,
        );
    }

    /// Fires the oldest live online state timer. Returns false if none was
    /// armed.
    pub fn fire_online_state_timer(&mut self) -> bool {
        match self.timers.fire(TimerId::OnlineStateTimeout) {
            Some(_) => {
                self.store.handle_online_state_timeout();
                true
            }
            None => false,
        }
    }
}

impl Default for StoreHarness {
    fn default() -> Self {
        Self::new()
    }
}
