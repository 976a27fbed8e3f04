//! # Tidal Sync Engine
//!
//! Client side of Tidal's live query sync.
//!
//! This crate provides:
//! - Watch stream orchestration with reconnects (`RemoteStore`)
//! - Aggregation of watch changes into consistent snapshots
//! - Online/offline state tracking with failure hysteresis
//! - Periodic LRU garbage collection of the local cache
//! - A serialized execution context with cancellable timers
//! - The `SyncClient` actor tying it all together
//! - In-memory persistence and an in-process loopback backend
//!
//! ## Architecture
//!
//! Everything that touches client state runs on one worker task:
//! 1. Callers, the watch stream and timers enqueue commands
//! 2. The worker applies them to the remote store one at a time
//! 3. Consistent snapshots are handed to the `RemoteSyncer`
//!
//! ## Key Invariants
//!
//! - A target id is listened to at most once
//! - Snapshots never go below the cache's last remote version
//! - Per-target errors never take down the stream
//! - A cancelled timer never runs

#![deny(unsafe_code)]
#![warn(missing_docs)]

#[macro_use]
mod assert;

mod aggregator;
mod client;
mod config;
mod error;
mod identity;
mod loopback;
mod lru;
mod lru_scheduler;
mod memory;
mod online_state;
mod persistence;
mod queue;
mod remote_store;
mod timer;
mod transport;

pub use aggregator::{TargetMetadataProvider, WatchChangeAggregator};
pub use client::{Command, SyncClient};
pub use config::{LruParams, OnlineStateConfig, RetryConfig, SyncConfig, COLLECTION_DISABLED};
pub use error::{SyncError, SyncResult};
pub use identity::{IdentityProvider, StaticIdentity, User, UserListener};
pub use loopback::{LoopbackBackend, LoopbackWatchStream};
pub use lru::{LruDelegate, LruGarbageCollector, LruResults};
pub use lru_scheduler::LruScheduler;
pub use memory::MemoryPersistence;
pub use online_state::{OnlineState, OnlineStateTracker};
pub use persistence::{LocalStore, Persistence};
pub use queue::{AsyncQueue, QueueReceiver, WeakQueue};
pub use remote_store::{NetworkPolicy, RemoteStore, RemoteSyncer, SingleProcess};
pub use timer::{DelayedOperation, ManualScheduler, Scheduler, TimerFired, TimerId};
pub use transport::{
    ConnectionId, MockWatchStream, StreamEvent, WatchEventSink, WatchRequest, WatchStream,
};

/// Version of the sync engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
