//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tidal_sync_engine::{MemoryPersistence, TargetMetadataProvider, WatchChangeAggregator};
use tidal_sync_protocol::{
    DocumentKey, MaybeDocument, Query, QueryPurpose, RemoteEvent, ResumeToken, SnapshotVersion,
    TargetChange, TargetData, TargetId, TargetStateChange, WatchTargetChangeState,
};

/// Target metadata with no previously synced documents.
#[derive(Debug, Default)]
pub struct BenchMetadata {
    targets: BTreeMap<TargetId, TargetData>,
}

impl TargetMetadataProvider for BenchMetadata {
    fn remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
        BTreeSet::new()
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }
}

/// Generate a document in `collection` with a random payload.
pub fn random_document(collection: &str, index: usize, version: i64) -> MaybeDocument {
    let mut rng = rand::thread_rng();
    let key = DocumentKey::parse(&format!("{collection}/doc{index}")).expect("Valid key");
    let data = serde_json::json!({
        "index": index,
        "score": rng.gen::<u32>(),
        "tag": format!("{:08x}", rng.gen::<u32>()),
    });
    MaybeDocument::document(key, SnapshotVersion::from_micros(version), data)
}

/// Create an aggregator with `count` acknowledged targets on collections
/// `c0..c{count}`.
pub fn acked_aggregator(count: usize) -> (WatchChangeAggregator, BenchMetadata) {
    let mut aggregator = WatchChangeAggregator::new();
    let mut metadata = BenchMetadata::default();
    for i in 0..count {
        let target_id = TargetId::new(i as i32 * 2 + 2);
        let query = Query::at_path(&format!("c{i}")).expect("Valid path");
        metadata.targets.insert(
            target_id,
            TargetData::new(query, target_id, QueryPurpose::Listen, i as i64 + 1),
        );
        aggregator.record_pending_target_request(target_id);
    }
    let ack = TargetStateChange {
        state: WatchTargetChangeState::Added,
        target_ids: metadata.targets.keys().copied().collect(),
        resume_token: ResumeToken::empty(),
        cause: None,
    };
    aggregator.handle_target_change(&ack, &metadata);
    (aggregator, metadata)
}

/// Fill a cache with `targets` targets of `documents` documents each and
/// release the first `released`.
pub fn filled_persistence(
    persistence: MemoryPersistence,
    targets: usize,
    documents: usize,
    released: usize,
) -> MemoryPersistence {
    for t in 0..targets {
        let collection = format!("c{t}");
        let target = persistence.allocate_target(Query::at_path(&collection).expect("Valid path"));
        let version = t as i64 + 1;
        let mut change = TargetChange {
            resume_token: ResumeToken::from(format!("v{version}").into_bytes()),
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            ..RemoteEvent::default()
        };
        for d in 0..documents {
            let document = random_document(&collection, d, version);
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target.target_id(), change);
        persistence
            .apply_remote_event(&event)
            .expect("Memory persistence is open");
        if t < released {
            persistence.release_target(target.target_id());
        }
    }
    persistence
}
