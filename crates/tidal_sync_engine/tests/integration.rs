//! End-to-end tests: a `SyncClient` talking to the loopback backend.
//!
//! Time is paused, so sleeping lets every runnable task drain before the
//! clock moves.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidal_sync_engine::{
    LoopbackBackend, LoopbackWatchStream, LruParams, MemoryPersistence, OnlineState, RetryConfig,
    StaticIdentity, SyncClient, SyncConfig, SyncError, User,
};
use tidal_sync_protocol::{Query, StatusCode, TargetData};
use tidal_testkit::{key, RecordingHandle, RecordingSyncer};

struct Session {
    client: SyncClient,
    backend: LoopbackBackend,
    persistence: Arc<MemoryPersistence>,
    recorded: RecordingHandle,
    identity: StaticIdentity,
}

impl Session {
    fn start(identity: StaticIdentity, lru: LruParams) -> Self {
        let backend = LoopbackBackend::new();
        let persistence = Arc::new(MemoryPersistence::new(lru));
        let syncer = RecordingSyncer::with_persistence(Arc::clone(&persistence));
        let recorded = syncer.handle();
        let config =
            SyncConfig::new().with_retry(RetryConfig::new(Duration::from_secs(1)).without_jitter());

        let stream_backend = backend.clone();
        let retry = config.retry.clone();
        let client = SyncClient::start(
            config,
            move |sink| LoopbackWatchStream::new(stream_backend, sink, retry),
            syncer,
            Arc::clone(&persistence),
            &identity,
        );
        Self {
            client,
            backend,
            persistence,
            recorded,
            identity,
        }
    }

    fn signed_in() -> Self {
        Self::start(StaticIdentity::new(User::new("alice")), LruParams::default())
    }

    fn target(&self, path: &str) -> TargetData {
        self.persistence
            .allocate_target(Query::at_path(path).unwrap())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn commands_wait_for_the_first_user() {
    let session = Session::start(StaticIdentity::pending(), LruParams::default());
    let target = session.target("rooms");

    let client = session.client.clone();
    let listen = tokio::spawn(async move { client.listen(target).await });
    settle().await;
    assert!(!listen.is_finished());
    assert_eq!(session.backend.connection_count(), 0);

    session.identity.set_user(User::new("alice"));
    listen.await.unwrap().unwrap();
    settle().await;
    assert_eq!(session.backend.connection_count(), 1);
    // The first user is not a change.
    assert!(session.recorded.users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn listen_delivers_consistent_snapshots() {
    let session = Session::signed_in();
    session
        .backend
        .set_document(key("rooms/a"), json!({ "name": "lobby" }));

    let target = session.target("rooms");
    let target_id = target.target_id();
    session.client.listen(target).await.unwrap();
    settle().await;

    let events = session.recorded.events();
    assert_eq!(events.len(), 1);
    let first = &events[0];
    assert_eq!(first.snapshot_version, session.backend.snapshot_version());
    let change = &first.target_changes[&target_id];
    assert!(change.current);
    assert!(change.added_documents.contains(&key("rooms/a")));
    assert!(session.persistence.document(&key("rooms/a")).is_some());
    assert_eq!(session.recorded.online_states(), vec![OnlineState::Online]);

    session
        .backend
        .set_document(key("rooms/b"), json!({ "name": "kitchen" }));
    settle().await;

    let events = session.recorded.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].snapshot_version > events[0].snapshot_version);
    assert!(events[1].document_updates.contains_key(&key("rooms/b")));
    assert_eq!(session.persistence.remote_keys_for_target(target_id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_listen_is_reported_and_stream_survives() {
    let session = Session::signed_in();
    session.backend.deny_path("secrets");

    let rooms = session.target("rooms");
    let secrets = session.target("secrets");
    let secrets_id = secrets.target_id();
    session.client.listen(rooms).await.unwrap();
    session.client.listen(secrets).await.unwrap();
    settle().await;

    let rejections = session.recorded.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].0, secrets_id);
    assert_eq!(rejections[0].1.code(), Some(StatusCode::PermissionDenied));
    assert_eq!(session.backend.connection_count(), 1);
    assert!(!session.backend.watched_targets().contains(&secrets_id));
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_goes_offline_and_recovers() {
    let session = Session::signed_in();
    session.client.listen(session.target("rooms")).await.unwrap();
    settle().await;
    assert_eq!(session.recorded.last_online_state(), Some(OnlineState::Online));

    // One failure is tolerated while the reconnect backs off.
    session.backend.set_reachable(false);
    settle().await;
    assert_eq!(session.recorded.last_online_state(), Some(OnlineState::Online));

    // The reconnect after one second is refused.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.recorded.last_online_state(), Some(OnlineState::Offline));

    session.backend.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        session.recorded.online_states(),
        vec![OnlineState::Online, OnlineState::Offline, OnlineState::Online]
    );
    assert_eq!(session.backend.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disabling_the_network_reports_unknown() {
    let session = Session::signed_in();
    session.client.listen(session.target("rooms")).await.unwrap();
    settle().await;

    session.client.disable_network().await.unwrap();
    assert_eq!(
        session.recorded.online_states(),
        vec![OnlineState::Online, OnlineState::Unknown]
    );
    session.client.enable_network().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn user_change_restarts_the_stream() {
    let session = Session::signed_in();
    session.client.listen(session.target("rooms")).await.unwrap();
    settle().await;

    session.identity.set_user(User::new("bob"));
    settle().await;

    assert_eq!(session.recorded.users(), vec![User::new("bob")]);
    assert_eq!(
        session.recorded.online_states(),
        vec![OnlineState::Online, OnlineState::Unknown, OnlineState::Online]
    );
    assert_eq!(session.backend.connection_count(), 1);

    // Same user again is not a change.
    session.identity.set_user(User::new("bob"));
    settle().await;
    assert_eq!(session.recorded.users().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lru_collects_released_targets_after_the_initial_delay() {
    let lru = LruParams::with_cache_size(1)
        .with_percentile(100)
        .with_delays(Duration::from_secs(60), Duration::from_secs(300));
    let session = Session::start(StaticIdentity::new(User::new("alice")), lru);
    session.backend.set_document(key("rooms/a"), json!({ "n": 1 }));

    let target = session.target("rooms");
    let target_id = target.target_id();
    session.client.listen(target).await.unwrap();
    settle().await;
    session.client.unlisten(target_id).await.unwrap();
    session.persistence.release_target(target_id);
    settle().await;

    tokio::time::sleep(Duration::from_secs(58)).await;
    assert_eq!(session.persistence.target_count(), 1);
    assert_eq!(session.persistence.document_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.persistence.target_count(), 0);
    assert_eq!(session.persistence.document_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn operations_after_shutdown_fail() {
    let session = Session::signed_in();
    session.client.listen(session.target("rooms")).await.unwrap();
    settle().await;

    session.client.shutdown().await.unwrap();
    settle().await;

    assert!(session.client.is_shut_down());
    assert!(session.persistence.is_shut_down());
    assert_eq!(session.backend.connection_count(), 0);
    assert_eq!(
        session.client.listen(session.target("users")).await,
        Err(SyncError::ShutDown)
    );
    assert_eq!(session.client.shutdown().await, Err(SyncError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_the_worker_down() {
    let Session {
        client,
        backend,
        persistence,
        recorded,
        identity,
    } = Session::signed_in();
    let target = persistence.allocate_target(Query::at_path("rooms").unwrap());
    client.listen(target).await.unwrap();
    settle().await;
    assert_eq!(backend.connection_count(), 1);

    drop(client);
    settle().await;
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(recorded.last_online_state(), Some(OnlineState::Unknown));

    // Nothing left running holds on to the cache, even past the LRU delay.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(Arc::strong_count(&persistence), 1);
    assert!(!persistence.is_shut_down());

    // A later user change has nowhere to go and is dropped quietly.
    identity.set_user(User::new("bob"));
    assert!(recorded.users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_client_before_the_first_user_ends_the_worker() {
    let Session {
        client,
        persistence,
        identity,
        ..
    } = Session::start(StaticIdentity::pending(), LruParams::default());
    drop(client);
    settle().await;

    assert_eq!(Arc::strong_count(&persistence), 1);
    identity.set_user(User::new("alice"));
}
