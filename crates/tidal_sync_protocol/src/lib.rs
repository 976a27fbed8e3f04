//! # Tidal Sync Protocol
//!
//! Value types exchanged between the Tidal watch client and its collaborators.
//!
//! This crate provides:
//! - `TargetId`, `Query` and the immutable `TargetData` descriptor
//! - `SnapshotVersion` and listen sequence numbers
//! - `DocumentKey` and `MaybeDocument`
//! - `WatchChange` notifications and `Status` codes
//! - `TargetChange` / `RemoteEvent`, the consistent snapshot output
//!
//! This is a pure value crate with no I/O operations. The wire encoding of
//! the watch stream is left to transports.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod remote_event;
mod status;
mod target;
mod version;
mod watch;

pub use document::{DocumentKey, MaybeDocument};
pub use error::{ProtocolError, ProtocolResult};
pub use remote_event::{RemoteEvent, TargetChange};
pub use status::{Status, StatusCode};
pub use target::{Filter, FilterOp, Query, QueryPurpose, ResumeToken, TargetData, TargetId};
pub use version::{ListenSequenceNumber, SnapshotVersion, INVALID_SEQUENCE_NUMBER};
pub use watch::{
    DocumentChange, ExistenceFilterChange, TargetStateChange, WatchChange, WatchTargetChangeState,
};
