//! Common incremental-processing abstractions for OVN northd.
//!
//! This crate provides the core traits and types shared by every
//! reconciliation node in the northd pipeline:
//!
//! - [`EngineNode`]: Base trait for a node of the incremental engine
//! - [`NodeState`] / [`HandlerResult`]: Output signalling of runs and handlers
//! - [`TrackedMap`]: Map that records new/updated/deleted keys between passes
//! - [`RateLimiter`]: Token bucket used to throttle repeated diagnostics
//! - [`EngineError`]: Fatal (per-pass) error type
//!
//! # Architecture
//!
//! The engine follows a run-to-completion dataflow model:
//!
//! 1. Northbound changes are observed as tracked rows in the NB database
//! 2. Nodes run in a fixed dependency order inside one SB transaction
//! 3. A node either recomputes fully (`run`) or applies an input's delta
//!    through a change handler; a handler that cannot apply a delta returns
//!    [`HandlerResult::Unhandled`] and the node is recomputed instead
//! 4. The SB transaction is committed and tracked data is cleared
//!
//! # Example
//!
//! ```ignore
//! use ovn_inc_common::{EngineNode, EngineResult, NodeState};
//!
//! struct Counter { runs: usize }
//!
//! impl EngineNode for Counter {
//!     type Input<'a> = &'a [u32];
//!     fn name(&self) -> &'static str { "counter" }
//!     fn run(&mut self, input: &[u32]) -> EngineResult<NodeState> {
//!         self.runs += input.len();
//!         Ok(NodeState::Updated)
//!     }
//! }
//! ```

mod error;
mod node;
mod rate_limit;
mod state;
mod tracked_map;

pub use error::{EngineError, EngineResult};
pub use node::{EngineNode, NodeStats};
pub use rate_limit::RateLimiter;
pub use state::{HandlerResult, NodeState};
pub use tracked_map::{TrackedChanges, TrackedMap};

#[doc(hidden)]
pub use tracing as __tracing;
