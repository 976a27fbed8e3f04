//! # Tidal Testkit
//!
//! Test utilities for the Tidal sync client.
//!
//! This crate provides:
//! - Target and document fixtures
//! - A `RemoteSyncer` that records everything it is told
//! - A harness driving a `RemoteStore` over a mock stream and manual timers
//! - Property-based generators for listen sequences and watch traffic
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidal_testkit::prelude::*;
//!
//! #[test]
//! fn listen_starts_stream() {
//!     let mut harness = StoreHarness::new();
//!     harness.store.listen(target(2, "rooms"));
//!     assert_eq!(harness.stream().starts(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
