//! CLI command implementations.

pub mod gc;
pub mod simulate;
