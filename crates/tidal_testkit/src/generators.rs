//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tidal_sync_protocol::{DocumentKey, MaybeDocument, SnapshotVersion, StatusCode};

/// Strategy for generating collection paths.
pub fn collection_path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for generating document keys.
pub fn document_key_strategy() -> impl Strategy<Value = DocumentKey> {
    (
        collection_path_strategy(),
        prop::string::string_regex("[a-zA-Z0-9]{1,12}").expect("Invalid regex"),
    )
        .prop_map(|(collection, id)| {
            DocumentKey::parse(&format!("{collection}/{id}")).expect("Generated key is valid")
        })
}

/// Strategy for generating document bodies: small JSON objects.
pub fn document_data_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            any::<bool>().prop_map(|b| json!(b)),
            "[a-zA-Z ]{0,16}".prop_map(|s| json!(s)),
        ],
        0..6,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>()))
}

/// Strategy for generating documents, a fifth of them tombstones.
pub fn maybe_document_strategy() -> impl Strategy<Value = MaybeDocument> {
    (
        document_key_strategy(),
        1i64..1_000_000,
        document_data_strategy(),
        0u8..5,
    )
        .prop_map(|(key, version, data, kind)| {
            let version = SnapshotVersion::from_micros(version);
            if kind == 0 {
                MaybeDocument::no_document(key, version)
            } else {
                MaybeDocument::document(key, version, data)
            }
        })
}

/// A listen-set operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOp {
    /// Listen to a target id that is not active.
    Listen(i32),
    /// Unlisten from a target id that is active.
    Unlisten(i32),
}

/// Strategy for generating valid listen/unlisten sequences over target ids
/// `1..=max_targets`.
///
/// Each generated step toggles one target, so a listen is never duplicated
/// and an unlisten always names an active target.
pub fn listen_ops_strategy(max_targets: i32, max_len: usize) -> impl Strategy<Value = Vec<ListenOp>> {
    prop::collection::vec(1..=max_targets.max(1), 0..max_len).prop_map(|toggles| {
        let mut active = BTreeSet::new();
        toggles
            .into_iter()
            .map(|id| {
                if active.insert(id) {
                    ListenOp::Listen(id)
                } else {
                    active.remove(&id);
                    ListenOp::Unlisten(id)
                }
            })
            .collect()
    })
}

/// An externally observable event in a client's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityOp {
    /// Toggle listening on a target id.
    Toggle(i32),
    /// The current connection opens.
    Open,
    /// The backend sends a snapshot marker at a version.
    Snapshot(i64),
    /// The current connection fails.
    Fail(StatusCode),
    /// The connection attempt timer fires, if armed.
    Timeout,
    /// Network use is enabled or disabled.
    Network(bool),
}

/// Strategy for generating connectivity scenarios.
pub fn connectivity_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<ConnectivityOp>> {
    let op = prop_oneof![
        3 => (1i32..=3).prop_map(ConnectivityOp::Toggle),
        2 => Just(ConnectivityOp::Open),
        2 => (1i64..100).prop_map(ConnectivityOp::Snapshot),
        2 => prop_oneof![
            Just(StatusCode::Unavailable),
            Just(StatusCode::DeadlineExceeded),
            Just(StatusCode::Internal),
        ]
        .prop_map(ConnectivityOp::Fail),
        1 => Just(ConnectivityOp::Timeout),
        1 => any::<bool>().prop_map(ConnectivityOp::Network),
    ];
    prop::collection::vec(op, 0..max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn listen_ops_are_valid(ops in listen_ops_strategy(4, 40)) {
            let mut active = BTreeSet::new();
            for op in ops {
                match op {
                    ListenOp::Listen(id) => prop_assert!(active.insert(id)),
                    ListenOp::Unlisten(id) => prop_assert!(active.remove(&id)),
                }
            }
        }

        #[test]
        fn generated_keys_have_two_segments(key in document_key_strategy()) {
            prop_assert_eq!(key.path().split('/').count(), 2);
        }
    }
}
