//! Least-recently-used garbage collection of the local cache.
//!
//! Every target and document carries the listen sequence number of its last
//! use. A collection pass picks a percentile of the oldest sequence numbers
//! and removes inactive targets and orphaned documents at or below it.

use crate::config::LruParams;
use crate::error::SyncResult;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use tidal_sync_protocol::{ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use tracing::{debug, info};

/// Cache operations the garbage collector walks.
///
/// A collection pass calls these within one atomic persistence operation.
pub trait LruDelegate {
    /// Number of targets plus orphaned documents.
    fn sequence_number_count(&self) -> SyncResult<usize>;

    /// Sequence numbers of all targets and orphaned documents.
    fn sequence_numbers(&self) -> SyncResult<Vec<ListenSequenceNumber>>;

    /// Approximate cache size in bytes.
    fn cache_size_bytes(&self) -> SyncResult<i64>;

    /// Removes targets at or below `upper_bound` that are not active.
    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> SyncResult<usize>;

    /// Removes documents at or below `upper_bound` that no target references.
    fn remove_orphaned_documents(&mut self, upper_bound: ListenSequenceNumber) -> SyncResult<usize>;
}

/// Outcome of a collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LruResults {
    /// Whether collection ran (false when skipped).
    pub did_run: bool,
    /// Sequence numbers the pass aimed to collect.
    pub sequence_numbers_collected: usize,
    /// Targets removed.
    pub targets_removed: usize,
    /// Documents removed.
    pub documents_removed: usize,
}

impl LruResults {
    /// Results of a skipped pass.
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Decides what to collect and drives an [`LruDelegate`].
#[derive(Debug, Clone)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    /// Creates a collector.
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    /// Returns the collection parameters.
    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Returns how many sequence numbers make up `percentile` percent.
    pub fn calculate_target_count(
        &self,
        delegate: &dyn LruDelegate,
        percentile: u32,
    ) -> SyncResult<usize> {
        let count = delegate.sequence_number_count()?;
        Ok(count * percentile as usize / 100)
    }

    /// Returns the `n`th smallest sequence number (1-based).
    ///
    /// Returns [`INVALID_SEQUENCE_NUMBER`] when `n` is zero.
    pub fn nth_sequence_number(
        &self,
        delegate: &dyn LruDelegate,
        n: usize,
    ) -> SyncResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut sequence_numbers = delegate.sequence_numbers()?;
        sequence_numbers.sort_unstable();
        Ok(sequence_numbers
            .get(n - 1)
            .or(sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER))
    }

    /// Runs a collection pass if the cache has outgrown the threshold.
    pub fn collect(
        &self,
        delegate: &mut dyn LruDelegate,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> SyncResult<LruResults> {
        if self.params.is_disabled() {
            debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }

        let cache_size = delegate.cache_size_bytes()?;
        if cache_size < self.params.cache_size_collection_threshold {
            debug!(
                cache_size,
                threshold = self.params.cache_size_collection_threshold,
                "Garbage collection skipped; cache size below threshold"
            );
            return Ok(LruResults::did_not_run());
        }

        self.run_garbage_collection(delegate, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        delegate: &mut dyn LruDelegate,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> SyncResult<LruResults> {
        let start = Instant::now();

        let mut sequence_numbers_to_collect =
            self.calculate_target_count(delegate, self.params.percentile_to_collect)?;
        let maximum = self.params.maximum_sequence_numbers_to_collect;
        if sequence_numbers_to_collect > maximum {
            info!(
                requested = sequence_numbers_to_collect,
                maximum, "Capping sequence numbers to collect"
            );
            sequence_numbers_to_collect = maximum;
        }
        let counted = Instant::now();

        let upper_bound = self.nth_sequence_number(delegate, sequence_numbers_to_collect)?;
        let found = Instant::now();

        let targets_removed = delegate.remove_targets(upper_bound, active_target_ids)?;
        let targets_done = Instant::now();

        let documents_removed = delegate.remove_orphaned_documents(upper_bound)?;
        let done = Instant::now();

        debug!(
            count_ms = (counted - start).as_millis() as u64,
            upper_bound,
            find_ms = (found - counted).as_millis() as u64,
            targets_removed,
            targets_ms = (targets_done - found).as_millis() as u64,
            documents_removed,
            documents_ms = (done - targets_done).as_millis() as u64,
            total_ms = (done - start).as_millis() as u64,
            "LRU garbage collection finished"
        );

        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        })
    }
}
