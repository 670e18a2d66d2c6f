//! Base EngineNode trait.

use crate::{EngineResult, NodeState};

/// Per-node counters reported by the pass driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Number of full recomputes.
    pub recomputes: u64,
    /// Number of deltas applied by change handlers.
    pub handled: u64,
    /// Number of times a handler asked for a recompute.
    pub fallbacks: u64,
}

impl NodeStats {
    /// Records the outcome of a full run.
    pub fn record_run(&mut self) {
        self.recomputes += 1;
    }

    /// Records a handler invocation; `handled` is false when the handler
    /// forced a recompute.
    pub fn record_handler(&mut self, handled: bool) {
        if handled {
            self.handled += 1;
        } else {
            self.fallbacks += 1;
        }
    }
}

/// Base trait for all nodes of the incremental engine.
///
/// Each reconciliation step (collector, sync engine, decoder) implements this
/// trait. The pass driver owns every node and calls `run` in dependency
/// order whenever an input changed and no change handler could absorb the
/// change.
///
/// # Lifecycle
///
/// 1. Construction: `new()` plays the role of `init`
/// 2. Pass: `run()` or one of the node's `handle_*` methods
/// 3. End of pass: `clear_tracked_data()` drops per-pass deltas
/// 4. Shutdown: `cleanup()` releases node data
///
/// `Input` borrows whatever upstream outputs and database handles the node
/// reads; nodes never hold those borrows across passes.
pub trait EngineNode {
    /// Inputs consumed by a full run.
    type Input<'a>;

    /// Returns the name of this node (for logging and reports).
    fn name(&self) -> &'static str;

    /// Recomputes the node's output from scratch.
    ///
    /// An error aborts the whole pass; the node is recomputed on the next
    /// pass.
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState>;

    /// Drops per-pass delta sets. Called once at the end of every pass.
    fn clear_tracked_data(&mut self) {}

    /// Releases node data on shutdown.
    fn cleanup(&mut self) {}
}
