//! In-memory local cache.

use crate::config::LruParams;
use crate::error::{SyncError, SyncResult};
use crate::lru::{LruDelegate, LruGarbageCollector, LruResults};
use crate::persistence::{LocalStore, Persistence};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tidal_sync_protocol::{
    DocumentKey, ListenSequenceNumber, MaybeDocument, Query, QueryPurpose, RemoteEvent,
    SnapshotVersion, TargetData, TargetId,
};
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedDocument {
    document: MaybeDocument,
    sequence_number: ListenSequenceNumber,
}

#[derive(Debug)]
struct MemoryCache {
    last_remote_snapshot_version: SnapshotVersion,
    highest_sequence_number: ListenSequenceNumber,
    next_target_id: i32,
    targets: BTreeMap<TargetId, TargetData>,
    active_targets: BTreeSet<TargetId>,
    target_documents: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    documents: BTreeMap<DocumentKey, CachedDocument>,
    shut_down: bool,
}

impl MemoryCache {
    fn new() -> Self {
        Self {
            last_remote_snapshot_version: SnapshotVersion::NONE,
            highest_sequence_number: 0,
            next_target_id: 2,
            targets: BTreeMap::new(),
            active_targets: BTreeSet::new(),
            target_documents: BTreeMap::new(),
            documents: BTreeMap::new(),
            shut_down: false,
        }
    }

    fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.target_documents.values().any(|keys| keys.contains(key))
    }

    fn orphaned_sequence_numbers(&self) -> impl Iterator<Item = ListenSequenceNumber> + '_ {
        self.documents
            .iter()
            .filter(|(key, _)| !self.is_referenced(key))
            .map(|(_, cached)| cached.sequence_number)
    }

    fn check_open(&self) -> SyncResult<()> {
        if self.shut_down {
            return Err(SyncError::persistence("persistence has been shut down"));
        }
        Ok(())
    }
}

impl LruDelegate for MemoryCache {
    fn sequence_number_count(&self) -> SyncResult<usize> {
        self.check_open()?;
        Ok(self.targets.len() + self.orphaned_sequence_numbers().count())
    }

    fn sequence_numbers(&self) -> SyncResult<Vec<ListenSequenceNumber>> {
        self.check_open()?;
        Ok(self
            .targets
            .values()
            .map(TargetData::sequence_number)
            .chain(self.orphaned_sequence_numbers())
            .collect())
    }

    fn cache_size_bytes(&self) -> SyncResult<i64> {
        self.check_open()?;
        let mut size = 0usize;
        for (key, cached) in &self.documents {
            size += key.path().len();
            if let Some(data) = cached.document.data() {
                size += serde_json::to_vec(data)
                    .map_err(|e| SyncError::persistence(e.to_string()))?
                    .len();
            }
        }
        for target in self.targets.values() {
            size += target.query().canonical_id().len() + target.resume_token().as_bytes().len();
        }
        Ok(size as i64)
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> SyncResult<usize> {
        self.check_open()?;
        let removable: Vec<TargetId> = self
            .targets
            .values()
            .filter(|t| t.sequence_number() <= upper_bound)
            .map(TargetData::target_id)
            .filter(|id| !active_target_ids.contains(id))
            .collect();
        for target_id in &removable {
            self.targets.remove(target_id);
            self.target_documents.remove(target_id);
        }
        Ok(removable.len())
    }

    fn remove_orphaned_documents(&mut self, upper_bound: ListenSequenceNumber) -> SyncResult<usize> {
        self.check_open()?;
        let removable: Vec<DocumentKey> = self
            .documents
            .iter()
            .filter(|(key, cached)| cached.sequence_number <= upper_bound && !self.is_referenced(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &removable {
            self.documents.remove(key);
        }
        Ok(removable.len())
    }
}

/// A local cache held in memory.
///
/// Shared between the client (as [`LocalStore`] and [`Persistence`]) and the
/// sync layer applying events to it.
#[derive(Debug)]
pub struct MemoryPersistence {
    cache: Mutex<MemoryCache>,
    garbage_collector: LruGarbageCollector,
}

impl MemoryPersistence {
    /// Creates an empty cache collected according to `params`.
    pub fn new(params: LruParams) -> Self {
        Self {
            cache: Mutex::new(MemoryCache::new()),
            garbage_collector: LruGarbageCollector::new(params),
        }
    }

    /// Allocates a target for `query` and marks it active.
    ///
    /// A query that already has a cached target reuses its id.
    pub fn allocate_target(&self, query: Query) -> TargetData {
        let mut cache = self.cache.lock();
        let sequence_number = cache.next_sequence_number();
        let canonical_id = query.canonical_id();

        let existing = cache
            .targets
            .values()
            .find(|t| t.query().canonical_id() == canonical_id)
            .cloned();
        let target_data = match existing {
            Some(existing) => existing.with_sequence_number(sequence_number),
            None => {
                let target_id = TargetId::new(cache.next_target_id);
                cache.next_target_id += 2;
                TargetData::new(query, target_id, QueryPurpose::Listen, sequence_number)
            }
        };

        let target_id = target_data.target_id();
        cache.targets.insert(target_id, target_data.clone());
        cache.active_targets.insert(target_id);
        debug!(target_id = %target_id, sequence_number, "Allocated target");
        target_data
    }

    /// Marks a target inactive, leaving its data for garbage collection.
    pub fn release_target(&self, target_id: TargetId) {
        let mut cache = self.cache.lock();
        let sequence_number = cache.next_sequence_number();
        if let Some(target) = cache.targets.get(&target_id) {
            let updated = target.with_sequence_number(sequence_number);
            cache.targets.insert(target_id, updated);
        }
        cache.active_targets.remove(&target_id);
    }

    /// Applies a remote event to the cache.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> SyncResult<()> {
        let mut cache = self.cache.lock();
        cache.check_open()?;
        let sequence_number = cache.next_sequence_number();

        for (target_id, change) in &event.target_changes {
            if let Some(target) = cache.targets.get(target_id) {
                if !change.resume_token.is_empty() {
                    let updated = target
                        .with_resume_token(change.resume_token.clone(), event.snapshot_version)
                        .with_sequence_number(sequence_number);
                    cache.targets.insert(*target_id, updated);
                }
            }
            let keys = cache.target_documents.entry(*target_id).or_default();
            keys.extend(change.added_documents.iter().cloned());
            keys.extend(change.modified_documents.iter().cloned());
            for key in &change.removed_documents {
                keys.remove(key);
            }
        }
        for target_id in &event.target_mismatches {
            cache.target_documents.remove(target_id);
        }

        for (key, document) in &event.document_updates {
            cache.documents.insert(
                key.clone(),
                CachedDocument {
                    document: document.clone(),
                    sequence_number,
                },
            );
        }

        if event.snapshot_version > cache.last_remote_snapshot_version {
            cache.last_remote_snapshot_version = event.snapshot_version;
        }
        Ok(())
    }

    /// Keys cached for a target.
    pub fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.cache
            .lock()
            .target_documents
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a cached document.
    pub fn document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        self.cache
            .lock()
            .documents
            .get(key)
            .map(|cached| cached.document.clone())
    }

    /// Returns the number of cached documents, tombstones included.
    pub fn document_count(&self) -> usize {
        self.cache.lock().documents.len()
    }

    /// Returns the number of cached targets, active or not.
    pub fn target_count(&self) -> usize {
        self.cache.lock().targets.len()
    }

    /// Returns the ids of active targets.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.cache.lock().active_targets.clone()
    }

    /// Returns the approximate cache size in bytes.
    pub fn cache_size_bytes(&self) -> SyncResult<i64> {
        self.cache.lock().cache_size_bytes()
    }

    /// Overrides the last remote snapshot version.
    pub fn set_last_remote_snapshot_version(&self, version: SnapshotVersion) {
        self.cache.lock().last_remote_snapshot_version = version;
    }

    /// Returns true once shut down.
    pub fn is_shut_down(&self) -> bool {
        self.cache.lock().shut_down
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(LruParams::default())
    }
}

impl LocalStore for MemoryPersistence {
    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.cache.lock().last_remote_snapshot_version
    }
}

impl Persistence for MemoryPersistence {
    fn garbage_collector(&self) -> LruGarbageCollector {
        self.garbage_collector.clone()
    }

    fn collect_garbage(&self, collector: &LruGarbageCollector) -> SyncResult<LruResults> {
        let mut cache = self.cache.lock();
        cache.check_open()?;
        let active = cache.active_targets.clone();
        collector.collect(&mut *cache, &active)
    }

    fn shutdown(&self) {
        debug!("Shutting down memory persistence");
        self.cache.lock().shut_down = true;
    }
}
