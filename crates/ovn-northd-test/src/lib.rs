//! Integration test infrastructure for ovn-northd-sync
//!
//! Provides:
//! - Northbound topology builders
//! - Southbound seed rows (legacy datapaths, stale bindings, FDB entries)
//! - Southbound verification helpers for the binding invariants

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
