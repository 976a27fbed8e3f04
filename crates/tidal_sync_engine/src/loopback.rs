//! In-process backend and watch stream.
//!
//! [`LoopbackBackend`] holds a document set and answers watch requests the
//! way a real backend would: acknowledge, send matching documents, mark the
//! target current, then close the snapshot with a global version. Writes are
//! pushed to every connection watching a matching query. Faults (rejected
//! paths, unreachable backend, existence filters) can be injected by tests
//! and the CLI.
//!
//! Queries match by path only; filters and limits are ignored.

use crate::config::RetryConfig;
use crate::transport::{ConnectionId, StreamEvent, WatchEventSink, WatchStream};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tidal_sync_protocol::{
    DocumentKey, MaybeDocument, Query, ResumeToken, SnapshotVersion, Status, StatusCode,
    TargetData, TargetId, WatchChange, WatchTargetChangeState,
};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

struct Connection {
    sink: WatchEventSink,
    targets: BTreeMap<TargetId, Query>,
}

struct BackendState {
    version: i64,
    next_connection: ConnectionId,
    documents: BTreeMap<DocumentKey, MaybeDocument>,
    connections: BTreeMap<ConnectionId, Connection>,
    denied_paths: BTreeSet<String>,
    reachable: bool,
}

impl BackendState {
    fn snapshot_version(&self) -> SnapshotVersion {
        SnapshotVersion::from_micros(self.version)
    }

    fn resume_token(&self) -> ResumeToken {
        ResumeToken::from(format!("v{}", self.version).into_bytes())
    }

    fn emit(&self, connection: ConnectionId, change: WatchChange, snapshot_version: SnapshotVersion) {
        if let Some(conn) = self.connections.get(&connection) {
            conn.sink.send(StreamEvent::Change {
                connection,
                change,
                snapshot_version,
            });
        }
    }

    fn matching_documents(&self, query: &Query) -> Vec<MaybeDocument> {
        self.documents
            .values()
            .filter(|doc| doc.exists() && matches(query, doc.key()))
            .cloned()
            .collect()
    }

    /// Sends a global snapshot marker to every connection.
    fn close_snapshot(&self) {
        let token = self.resume_token();
        for id in self.connections.keys() {
            self.emit(
                *id,
                WatchChange::target_with_token(WatchTargetChangeState::NoChange, vec![], token.clone()),
                self.snapshot_version(),
            );
        }
    }

    fn write(&mut self, document: MaybeDocument) {
        let key = document.key().clone();
        let mut notified = Vec::new();
        for (id, conn) in &self.connections {
            let targets: Vec<TargetId> = conn
                .targets
                .iter()
                .filter(|(_, query)| matches(query, &key))
                .map(|(target_id, _)| *target_id)
                .collect();
            if !targets.is_empty() {
                notified.push((*id, targets));
            }
        }
        for (id, targets) in notified {
            let change = if document.exists() {
                WatchChange::document(targets, vec![], document.clone())
            } else {
                WatchChange::document(vec![], targets, document.clone())
            };
            self.emit(id, change, SnapshotVersion::NONE);
        }
        self.documents.insert(key, document);
        self.close_snapshot();
    }
}

fn matches(query: &Query, key: &DocumentKey) -> bool {
    match query.document_key() {
        Some(doc_key) => doc_key == *key,
        None => key.collection_path() == query.path(),
    }
}

/// A backend living in the same process.
#[derive(Clone)]
pub struct LoopbackBackend {
    state: Arc<Mutex<BackendState>>,
}

impl LoopbackBackend {
    /// Creates a reachable backend with no documents at version 1.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                version: 1,
                next_connection: 1,
                documents: BTreeMap::new(),
                connections: BTreeMap::new(),
                denied_paths: BTreeSet::new(),
                reachable: true,
            })),
        }
    }

    /// Returns the current snapshot version.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.state.lock().snapshot_version()
    }

    /// Returns the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Returns the targets watched across all connections.
    pub fn watched_targets(&self) -> BTreeSet<TargetId> {
        self.state
            .lock()
            .connections
            .values()
            .flat_map(|c| c.targets.keys().copied())
            .collect()
    }

    /// Writes a document and pushes it to matching watchers.
    pub fn set_document(&self, key: DocumentKey, data: serde_json::Value) {
        let mut state = self.state.lock();
        state.version += 1;
        let document = MaybeDocument::document(key, state.snapshot_version(), data);
        debug!(key = %document.key(), version = %state.snapshot_version(), "Backend write");
        state.write(document);
    }

    /// Deletes a document and pushes the deletion to matching watchers.
    pub fn delete_document(&self, key: DocumentKey) {
        let mut state = self.state.lock();
        state.version += 1;
        let tombstone = MaybeDocument::no_document(key, state.snapshot_version());
        debug!(key = %tombstone.key(), version = %state.snapshot_version(), "Backend delete");
        state.write(tombstone);
    }

    /// Rejects future watches of queries at `path` with PermissionDenied.
    pub fn deny_path(&self, path: impl Into<String>) {
        self.state.lock().denied_paths.insert(path.into());
    }

    /// Makes the backend (un)reachable. Going unreachable drops every
    /// connection with Unavailable.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if reachable {
            return;
        }
        let connections = std::mem::take(&mut state.connections);
        for (id, conn) in connections {
            conn.sink.send(StreamEvent::Close {
                connection: id,
                status: Status::new(StatusCode::Unavailable, "backend unreachable"),
            });
        }
    }

    /// Sends an existence filter for `target_id` with the given count to
    /// every connection watching it, followed by a snapshot marker.
    pub fn send_existence_filter(&self, target_id: TargetId, count: usize) {
        let state = self.state.lock();
        for (id, conn) in &state.connections {
            if conn.targets.contains_key(&target_id) {
                state.emit(
                    *id,
                    WatchChange::existence_filter(target_id, count),
                    SnapshotVersion::NONE,
                );
            }
        }
        state.close_snapshot();
    }

    fn allocate_connection(&self) -> ConnectionId {
        let mut state = self.state.lock();
        let id = state.next_connection;
        state.next_connection += 1;
        id
    }

    fn connect(&self, connection: ConnectionId, sink: WatchEventSink) {
        let mut state = self.state.lock();
        if !state.reachable {
            trace!(connection, "Connection refused");
            sink.send(StreamEvent::Close {
                connection,
                status: Status::new(StatusCode::Unavailable, "backend unreachable"),
            });
            return;
        }
        state.connections.insert(
            connection,
            Connection {
                sink: sink.clone(),
                targets: BTreeMap::new(),
            },
        );
        sink.send(StreamEvent::Open { connection });
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.state.lock().connections.remove(&connection);
    }

    fn watch(&self, connection: ConnectionId, target_data: &TargetData) {
        let mut state = self.state.lock();
        let target_id = target_data.target_id();
        let query = target_data.query().clone();

        if state.denied_paths.contains(query.path()) {
            state.emit(
                connection,
                WatchChange::target_removed_with_cause(
                    vec![target_id],
                    Status::new(StatusCode::PermissionDenied, "missing or insufficient permissions"),
                ),
                SnapshotVersion::NONE,
            );
            return;
        }

        let Some(conn) = state.connections.get_mut(&connection) else {
            return;
        };
        conn.targets.insert(target_id, query.clone());

        state.emit(
            connection,
            WatchChange::target(WatchTargetChangeState::Added, vec![target_id]),
            SnapshotVersion::NONE,
        );
        for document in state.matching_documents(&query) {
            state.emit(
                connection,
                WatchChange::document(vec![target_id], vec![], document),
                SnapshotVersion::NONE,
            );
        }
        let token = state.resume_token();
        state.emit(
            connection,
            WatchChange::target_with_token(
                WatchTargetChangeState::Current,
                vec![target_id],
                token.clone(),
            ),
            SnapshotVersion::NONE,
        );
        state.emit(
            connection,
            WatchChange::target_with_token(WatchTargetChangeState::NoChange, vec![], token),
            state.snapshot_version(),
        );
    }

    fn unwatch(&self, connection: ConnectionId, target_id: TargetId) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&connection) else {
            return;
        };
        conn.targets.remove(&target_id);
        state.emit(
            connection,
            WatchChange::target(WatchTargetChangeState::Removed, vec![target_id]),
            SnapshotVersion::NONE,
        );
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackBackend")
            .field("version", &state.version)
            .field("documents", &state.documents.len())
            .field("connections", &state.connections.len())
            .field("reachable", &state.reachable)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Initial,
    Starting,
    Open,
}

/// Watch stream connected to a [`LoopbackBackend`].
///
/// Consecutive failed connections back off according to [`RetryConfig`];
/// the first message on a connection resets the backoff.
#[derive(Debug)]
pub struct LoopbackWatchStream {
    backend: LoopbackBackend,
    sink: WatchEventSink,
    retry: RetryConfig,
    state: StreamState,
    connection: ConnectionId,
    failed_attempts: u32,
    backoff_task: Option<AbortHandle>,
    idle: bool,
}

impl LoopbackWatchStream {
    /// Creates a stopped stream.
    pub fn new(backend: LoopbackBackend, sink: WatchEventSink, retry: RetryConfig) -> Self {
        Self {
            backend,
            sink,
            retry,
            state: StreamState::Initial,
            connection: 0,
            failed_attempts: 0,
            backoff_task: None,
            idle: false,
        }
    }

    /// Returns the current connection id.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns the number of consecutive failed connection attempts.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Returns true if marked idle since the last watch request.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    fn cancel_backoff(&mut self) {
        if let Some(task) = self.backoff_task.take() {
            task.abort();
        }
    }
}

impl WatchStream for LoopbackWatchStream {
    fn start(&mut self) {
        self.cancel_backoff();
        self.connection = self.backend.allocate_connection();
        self.state = StreamState::Starting;

        let delay = self.retry.delay_for_attempt(self.failed_attempts);
        if delay.is_zero() {
            self.backend.connect(self.connection, self.sink.clone());
            return;
        }

        debug!(
            connection = self.connection,
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnecting"
        );
        let backend = self.backend.clone();
        let sink = self.sink.clone();
        let connection = self.connection;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            backend.connect(connection, sink);
        });
        self.backoff_task = Some(task.abort_handle());
    }

    fn stop(&mut self) {
        self.cancel_backoff();
        self.backend.disconnect(self.connection);
        self.state = StreamState::Initial;
    }

    fn is_started(&self) -> bool {
        self.state != StreamState::Initial
    }

    fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    fn mark_idle(&mut self) {
        self.idle = true;
    }

    fn watch(&mut self, target_data: &TargetData) {
        self.idle = false;
        self.backend.watch(self.connection, target_data);
    }

    fn unwatch(&mut self, target_id: TargetId) {
        self.backend.unwatch(self.connection, target_id);
    }

    fn accept(&mut self, event: &StreamEvent) -> bool {
        if self.state == StreamState::Initial || event.connection() != self.connection {
            return false;
        }
        match event {
            StreamEvent::Open { .. } => {
                self.backoff_task = None;
                self.state = StreamState::Open;
            }
            StreamEvent::Change { .. } => self.failed_attempts = 0,
            StreamEvent::Close { status, .. } => {
                if !status.is_ok() {
                    self.failed_attempts += 1;
                }
                self.backend.disconnect(self.connection);
                self.state = StreamState::Initial;
            }
        }
        true
    }
}
