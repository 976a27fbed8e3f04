//! Local cache collaborators.

use crate::error::SyncResult;
use crate::lru::{LruGarbageCollector, LruResults};
use tidal_sync_protocol::SnapshotVersion;

/// Read access to the local cache needed by the remote store.
pub trait LocalStore: Send + Sync {
    /// Version of the last remote event durably applied to the cache.
    ///
    /// Snapshots below this version are never raised again.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}

/// Persistence operations driven by the client.
pub trait Persistence: Send + Sync {
    /// Returns the collector configured for this cache.
    fn garbage_collector(&self) -> LruGarbageCollector;

    /// Runs `collector` over the cache as one atomic operation.
    fn collect_garbage(&self, collector: &LruGarbageCollector) -> SyncResult<LruResults>;

    /// Releases resources. Later calls fail.
    fn shutdown(&self);
}
