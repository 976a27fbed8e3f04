//! Drives a `RemoteStore` by hand through the testkit harness: a mock watch
//! stream, manual timers and a recording sync layer.

use serde_json::json;
use std::sync::Arc;
use tidal_sync_engine::{
    ManualScheduler, MockWatchStream, NetworkPolicy, OnlineState, OnlineStateConfig, RemoteStore,
    TimerId, User, WatchRequest, WatchStream,
};
use tidal_sync_protocol::{
    MaybeDocument, QueryPurpose, ResumeToken, SnapshotVersion, Status, StatusCode, TargetData,
    TargetId, WatchChange, WatchTargetChangeState,
};
use tidal_testkit::{doc, key, target, RecordingSyncer, StoreHarness, TestLocalStore};

fn named(path: &str) -> MaybeDocument {
    doc(path, 1, json!({ "name": path }))
}

struct NoNetwork;

impl NetworkPolicy for NoNetwork {
    fn allows_network(&self) -> bool {
        false
    }
}

#[test]
fn listen_starts_stream_once() {
    let mut h = StoreHarness::new();
    assert!(!h.store.should_start_watch_stream());

    h.store.listen(target(1, "rooms"));
    assert!(h.stream().is_started());
    assert!(!h.store.should_start_watch_stream());

    h.store.listen(target(2, "users"));
    assert_eq!(h.stream().starts(), 1);
    // Not open yet, so nothing sent.
    assert!(h.stream().requests().is_empty());
}

#[test]
fn open_replays_every_target() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    h.store.listen(target(2, "users"));
    h.open();

    let watched: Vec<TargetId> = h.stream().watched().iter().map(|t| t.target_id()).collect();
    assert_eq!(watched, vec![TargetId::new(1), TargetId::new(2)]);
}

#[test]
fn listen_on_open_stream_sends_single_watch() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.store.watch_stream_mut().clear_requests();

    h.store.listen(target(2, "users"));
    assert_eq!(h.stream().requests().len(), 1);
    assert_eq!(h.stream().starts(), 1);
}

#[test]
#[should_panic(expected = "duplicate target id 1")]
fn duplicate_listen_is_fatal() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    h.store.listen(target(1, "rooms"));
}

#[test]
#[should_panic(expected = "not being listened to")]
fn unknown_unlisten_is_fatal() {
    let mut h = StoreHarness::new();
    h.store.unlisten(TargetId::new(9));
}

#[test]
fn active_set_tracks_listens_minus_unlistens() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    h.store.listen(target(2, "users"));
    h.store.listen(target(3, "rooms/a"));
    h.store.unlisten(TargetId::new(2));

    assert_eq!(
        h.store.active_target_ids(),
        vec![TargetId::new(1), TargetId::new(3)]
    );
    assert!(h.store.listen_target(TargetId::new(2)).is_none());
}

#[test]
fn unlisten_last_target_marks_open_stream_idle() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");

    h.store.unlisten(TargetId::new(1));
    assert!(h.stream().is_idle());
    assert!(h.stream().is_open());
    assert_eq!(h.stream().stops(), 0);
    assert_eq!(
        h.stream().requests().last(),
        Some(&WatchRequest::Unwatch(TargetId::new(1)))
    );
}

#[test]
fn unlisten_last_target_on_closed_stream_goes_unknown() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    assert_eq!(h.store.online_state(), OnlineState::Online);

    h.close(Status::new(StatusCode::Unavailable, "reset"));
    // Restarted, not yet open.
    assert!(h.stream().is_started());
    assert!(!h.stream().is_open());

    h.store.unlisten(TargetId::new(1));
    assert_eq!(h.store.online_state(), OnlineState::Unknown);
    assert_eq!(
        h.recorded.online_states(),
        vec![OnlineState::Online, OnlineState::Unknown]
    );
}

#[test]
fn unlisten_last_target_without_network_keeps_state() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.close(Status::new(StatusCode::Unavailable, "reset"));
    h.store.set_network_enabled(false);
    let published = h.recorded.online_states().len();

    h.store.unlisten(TargetId::new(1));
    assert_eq!(h.recorded.online_states().len(), published);
}

#[test]
fn event_raised_for_newer_version_with_resume_token() {
    let mut h = StoreHarness::new();
    h.local_store.set_version(5);
    h.listen_acked(7, "rooms");

    h.change(
        WatchChange::document(vec![TargetId::new(7)], vec![], named("rooms/a")),
        0,
    );
    h.change(
        WatchChange::target_with_token(
            WatchTargetChangeState::Current,
            vec![TargetId::new(7)],
            ResumeToken::from("r10"),
        ),
        10,
    );

    let events = h.recorded.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.snapshot_version, SnapshotVersion::from_micros(10));
    assert!(event.target_changes[&TargetId::new(7)]
        .added_documents
        .contains(&key("rooms/a")));

    let stored = h.store.listen_target(TargetId::new(7)).unwrap();
    assert_eq!(stored.resume_token(), &ResumeToken::from("r10"));
    assert_eq!(stored.snapshot_version(), SnapshotVersion::from_micros(10));
}

#[test]
fn equal_version_raises_lower_is_suppressed() {
    let mut h = StoreHarness::new();
    h.local_store.set_version(5);
    h.listen_acked(1, "rooms");

    h.change(WatchChange::target(WatchTargetChangeState::NoChange, vec![]), 4);
    assert!(h.recorded.events().is_empty());

    h.change(WatchChange::target(WatchTargetChangeState::NoChange, vec![]), 5);
    assert_eq!(h.recorded.events().len(), 1);
}

#[test]
fn change_without_version_raises_nothing() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.change(
        WatchChange::document(vec![TargetId::new(1)], vec![], named("rooms/a")),
        0,
    );
    assert!(h.recorded.events().is_empty());
}

#[test]
fn removal_with_cause_rejects_named_targets_only() {
    let mut h = StoreHarness::new();
    h.listen_acked(3, "rooms");
    h.listen_acked(4, "users");

    h.change(
        WatchChange::target_removed_with_cause(
            vec![TargetId::new(3)],
            Status::new(StatusCode::PermissionDenied, "no access"),
        ),
        12,
    );

    assert!(h.recorded.events().is_empty());
    let rejections = h.recorded.rejections();
    assert_eq!(rejections.len(), 1);
    let (id, err) = &rejections[0];
    assert_eq!(*id, TargetId::new(3));
    assert_eq!(err.code(), Some(StatusCode::PermissionDenied));
    assert_eq!(h.store.active_target_ids(), vec![TargetId::new(4)]);
}

#[test]
fn removal_with_cause_for_inactive_target_is_ignored() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.change(
        WatchChange::target_removed_with_cause(
            vec![TargetId::new(8)],
            Status::new(StatusCode::PermissionDenied, ""),
        ),
        0,
    );
    assert!(h.recorded.rejections().is_empty());
    assert_eq!(h.store.active_target_ids(), vec![TargetId::new(1)]);
}

#[test]
fn existence_filter_mismatch_relistens_with_purpose() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.change(
        WatchChange::document(vec![TargetId::new(1)], vec![], named("rooms/a")),
        0,
    );
    h.change(
        WatchChange::target_with_token(
            WatchTargetChangeState::Current,
            vec![TargetId::new(1)],
            ResumeToken::from("r1"),
        ),
        1,
    );
    h.store.watch_stream_mut().clear_requests();

    h.change(WatchChange::existence_filter(TargetId::new(1), 3), 2);

    let events = h.recorded.events();
    let event = events.last().unwrap();
    assert!(event.target_mismatches.contains(&TargetId::new(1)));

    let requests = h.stream().requests();
    assert_eq!(requests[0], WatchRequest::Unwatch(TargetId::new(1)));
    let mismatched: Vec<&TargetData> = h
        .stream()
        .watched()
        .into_iter()
        .filter(|t| t.purpose() == QueryPurpose::ExistenceFilterMismatch)
        .collect();
    assert_eq!(mismatched.len(), 1);
    assert!(mismatched[0].resume_token().is_empty());

    let stored = h.store.listen_target(TargetId::new(1)).unwrap();
    assert_eq!(stored.purpose(), QueryPurpose::Listen);
    assert!(stored.resume_token().is_empty());
    assert_eq!(stored.snapshot_version(), SnapshotVersion::from_micros(1));
}

#[test]
fn failed_apply_is_logged_not_propagated() {
    let mut h = StoreHarness::new();
    h.store.syncer_mut().set_fail_apply(true);
    h.listen_acked(1, "rooms");
    h.change(WatchChange::target(WatchTargetChangeState::Current, vec![TargetId::new(1)]), 3);
    assert!(h.recorded.events().is_empty());
    assert_eq!(h.store.active_target_ids(), vec![TargetId::new(1)]);
}

#[test]
fn close_with_error_restarts_and_counts_failures() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    let unavailable = Status::new(StatusCode::Unavailable, "down");

    h.close(unavailable.clone());
    assert_eq!(h.stream().starts(), 2);
    assert_eq!(h.store.online_state(), OnlineState::Unknown);

    h.close(unavailable);
    assert_eq!(h.stream().starts(), 3);
    assert_eq!(h.store.online_state(), OnlineState::Offline);
    assert_eq!(h.recorded.online_states(), vec![OnlineState::Offline]);
}

#[test]
fn close_when_not_needed_goes_unknown() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.store.set_network_enabled(false);

    h.close(Status::new(StatusCode::Unavailable, "down"));
    assert!(!h.stream().is_started());
    assert_eq!(h.store.online_state(), OnlineState::Unknown);
}

#[test]
#[should_panic(expected = "stopped gracefully while still needed")]
fn graceful_close_while_needed_is_fatal() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.close(Status::ok());
}

#[test]
fn events_from_stopped_connection_are_dropped() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    let stale = h.stream().open_event();
    h.store.handle_credential_change(User::new("bob"));

    h.store.handle_stream_event(stale);
    assert!(!h.stream().is_open());
    assert!(h.stream().requests().is_empty());
    assert_eq!(h.stream().starts(), 2);
    assert_eq!(h.recorded.users(), vec![User::new("bob")]);
}

#[test]
fn network_toggle_does_not_touch_stream() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");

    h.store.set_network_enabled(false);
    assert!(!h.store.can_use_network());
    assert!(h.stream().is_open());
    assert_eq!(h.stream().stops(), 0);
    assert_eq!(h.store.online_state(), OnlineState::Unknown);

    h.store.set_network_enabled(true);
    assert!(h.store.can_use_network());
    assert_eq!(h.stream().starts(), 1);
}

#[test]
fn policy_can_forbid_network() {
    let local_store = Arc::new(TestLocalStore::default());
    let mut store = RemoteStore::new(
        MockWatchStream::new(),
        RecordingSyncer::new(),
        local_store,
        Arc::new(ManualScheduler::new()),
        OnlineStateConfig::default(),
    )
    .with_network_policy(NoNetwork);

    store.listen(target(1, "rooms"));
    assert!(!store.watch_stream().is_started());
    assert!(!store.can_use_network());
}

#[test]
fn online_state_timeout_goes_offline() {
    let mut h = StoreHarness::new();
    h.store.listen(target(1, "rooms"));
    assert!(h.timers.has_pending(TimerId::OnlineStateTimeout));

    h.timers.fire(TimerId::OnlineStateTimeout).unwrap();
    h.store.handle_online_state_timeout();
    assert_eq!(h.store.online_state(), OnlineState::Offline);
    assert_eq!(h.recorded.online_states(), vec![OnlineState::Offline]);
}

#[test]
fn first_message_cancels_online_state_timeout() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    assert!(!h.timers.has_pending(TimerId::OnlineStateTimeout));
    assert_eq!(h.recorded.online_states(), vec![OnlineState::Online]);
}

#[test]
fn shutdown_stops_everything() {
    let mut h = StoreHarness::new();
    h.listen_acked(1, "rooms");
    h.store.shutdown();

    assert!(!h.stream().is_started());
    assert!(!h.store.is_network_enabled());
    assert_eq!(h.store.online_state(), OnlineState::Unknown);
}
