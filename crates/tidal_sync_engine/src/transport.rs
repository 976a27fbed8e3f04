//! Watch stream abstraction.
//!
//! A watch stream is a restartable, bidirectional connection to the backend.
//! Requests go out through [`WatchStream`] methods; everything the backend
//! says comes back as [`StreamEvent`]s through a [`WatchEventSink`], which
//! delivers them to the client's serialized context. Wire encoding, auth and
//! reconnect backoff are the implementation's business.

use std::fmt;
use std::sync::Arc;
use tidal_sync_protocol::{SnapshotVersion, Status, TargetData, TargetId, WatchChange};
use tokio::sync::mpsc;

/// Identifies one connection of a stream. Each `start` opens a new one.
pub type ConnectionId = u64;

/// Something the backend reported on a watch stream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The connection is ready for watch requests.
    Open {
        /// Connection the event belongs to.
        connection: ConnectionId,
    },
    /// A watch change, optionally closing a consistent snapshot.
    Change {
        /// Connection the event belongs to.
        connection: ConnectionId,
        /// The change.
        change: WatchChange,
        /// Global snapshot version, or [`SnapshotVersion::NONE`].
        snapshot_version: SnapshotVersion,
    },
    /// The connection ended.
    Close {
        /// Connection the event belongs to.
        connection: ConnectionId,
        /// Why it ended; OK for a requested stop.
        status: Status,
    },
}

impl StreamEvent {
    /// Returns the connection the event belongs to.
    pub fn connection(&self) -> ConnectionId {
        match self {
            StreamEvent::Open { connection }
            | StreamEvent::Change { connection, .. }
            | StreamEvent::Close { connection, .. } => *connection,
        }
    }
}

/// Delivers stream events to the client's serialized context.
#[derive(Clone)]
pub struct WatchEventSink {
    deliver: Arc<dyn Fn(StreamEvent) -> bool + Send + Sync>,
}

impl WatchEventSink {
    /// Creates a sink from a delivery function returning false once the
    /// receiving side is gone.
    pub fn new(deliver: impl Fn(StreamEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Creates a sink feeding an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(move |event| sender.send(event).is_ok()), receiver)
    }

    /// Delivers an event. Returns false if nobody is listening anymore.
    pub fn send(&self, event: StreamEvent) -> bool {
        (self.deliver)(event)
    }
}

impl fmt::Debug for WatchEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchEventSink").finish_non_exhaustive()
    }
}

/// A restartable watch stream.
///
/// All methods are called from the client's serialized context.
pub trait WatchStream: Send {
    /// Begins connecting. An [`StreamEvent::Open`] follows on success,
    /// a [`StreamEvent::Close`] on failure.
    fn start(&mut self);

    /// Closes the stream without emitting a close event.
    fn stop(&mut self);

    /// Returns true from `start` until the stream closes or is stopped.
    fn is_started(&self) -> bool;

    /// Returns true once the connection is ready for requests.
    fn is_open(&self) -> bool;

    /// Hints that no targets are left; the stream may close itself later.
    fn mark_idle(&mut self);

    /// Sends a watch request.
    fn watch(&mut self, target_data: &TargetData);

    /// Sends an unwatch request.
    fn unwatch(&mut self, target_id: TargetId);

    /// Updates stream state for an event about to be processed.
    ///
    /// Returns false for events from a connection that was stopped or
    /// replaced; those must be dropped.
    fn accept(&mut self, event: &StreamEvent) -> bool;
}

/// A request recorded by [`MockWatchStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchRequest {
    /// A watch request.
    Watch(TargetData),
    /// An unwatch request.
    Unwatch(TargetId),
}

/// A watch stream for testing that records what it was asked to do.
#[derive(Debug, Default)]
pub struct MockWatchStream {
    connection: ConnectionId,
    started: bool,
    open: bool,
    idle: bool,
    starts: usize,
    stops: usize,
    requests: Vec<WatchRequest>,
}

impl MockWatchStream {
    /// Creates a stopped mock stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current connection id.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns the open event for the current connection.
    pub fn open_event(&self) -> StreamEvent {
        StreamEvent::Open {
            connection: self.connection,
        }
    }

    /// Returns a change event for the current connection.
    pub fn change_event(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> StreamEvent {
        StreamEvent::Change {
            connection: self.connection,
            change,
            snapshot_version,
        }
    }

    /// Returns a close event for the current connection.
    pub fn close_event(&self, status: Status) -> StreamEvent {
        StreamEvent::Close {
            connection: self.connection,
            status,
        }
    }

    /// Returns how many times the stream was started.
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Returns how many times the stream was stopped.
    pub fn stops(&self) -> usize {
        self.stops
    }

    /// Returns true if marked idle since the last request.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Returns all recorded requests.
    pub fn requests(&self) -> &[WatchRequest] {
        &self.requests
    }

    /// Returns the descriptors of recorded watch requests.
    pub fn watched(&self) -> Vec<&TargetData> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                WatchRequest::Watch(data) => Some(data),
                WatchRequest::Unwatch(_) => None,
            })
            .collect()
    }

    /// Clears recorded requests.
    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }
}

impl WatchStream for MockWatchStream {
    fn start(&mut self) {
        self.connection += 1;
        self.starts += 1;
        self.started = true;
        self.open = false;
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.started = false;
        self.open = false;
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn mark_idle(&mut self) {
        self.idle = true;
    }

    fn watch(&mut self, target_data: &TargetData) {
        self.idle = false;
        self.requests.push(WatchRequest::Watch(target_data.clone()));
    }

    fn unwatch(&mut self, target_id: TargetId) {
        self.requests.push(WatchRequest::Unwatch(target_id));
    }

    fn accept(&mut self, event: &StreamEvent) -> bool {
        if !self.started || event.connection() != self.connection {
            return false;
        }
        match event {
            StreamEvent::Open { .. } => self.open = true,
            StreamEvent::Change { .. } => {}
            StreamEvent::Close { .. } => {
                self.started = false;
                self.open = false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_sync_protocol::StatusCode;

    #[test]
    fn mock_stream_lifecycle() {
        let mut stream = MockWatchStream::new();
        assert!(!stream.is_started());

        stream.start();
        assert!(stream.is_started());
        assert!(!stream.is_open());

        let open = stream.open_event();
        assert!(stream.accept(&open));
        assert!(stream.is_open());

        let close = stream.close_event(Status::new(StatusCode::Unavailable, "reset"));
        assert!(stream.accept(&close));
        assert!(!stream.is_started());
        assert!(!stream.is_open());
    }

    #[test]
    fn events_from_old_connections_are_rejected() {
        let mut stream = MockWatchStream::new();
        stream.start();
        let stale = stream.open_event();
        stream.stop();
        stream.start();

        assert!(!stream.accept(&stale));
        assert!(!stream.is_open());
        assert_eq!(stream.starts(), 2);
        assert_eq!(stream.stops(), 1);
    }

    #[test]
    fn sink_channel_delivers_until_receiver_dropped() {
        let (sink, mut receiver) = WatchEventSink::channel();
        assert!(sink.send(StreamEvent::Open { connection: 1 }));
        assert_eq!(receiver.try_recv().unwrap().connection(), 1);

        drop(receiver);
        assert!(!sink.send(StreamEvent::Open { connection: 2 }));
    }
}
