//! Node output state and change-handler result types.

use std::fmt;

/// Output state of a node after a full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeState {
    /// Output changed; dependents must react
    Updated,
    /// Output is identical to the previous pass
    #[default]
    Unchanged,
}

impl NodeState {
    /// Returns true if dependents must react to this node.
    pub fn is_updated(&self) -> bool {
        matches!(self, NodeState::Updated)
    }

    /// Merges two states; updated wins.
    pub fn merge(self, other: NodeState) -> NodeState {
        if self.is_updated() || other.is_updated() {
            NodeState::Updated
        } else {
            NodeState::Unchanged
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Updated => write!(f, "updated"),
            NodeState::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Result of an incremental change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerResult {
    /// Delta applied and the node's output changed
    HandledUpdated,
    /// Delta applied with no visible output change
    HandledUnchanged,
    /// Preconditions not met; the node must be recomputed
    Unhandled,
}

impl HandlerResult {
    /// Returns true if the handler applied the delta.
    pub fn is_handled(&self) -> bool {
        !matches!(self, HandlerResult::Unhandled)
    }

    /// Returns the node state implied by a handled result.
    ///
    /// Returns `None` for [`HandlerResult::Unhandled`].
    pub fn node_state(&self) -> Option<NodeState> {
        match self {
            HandlerResult::HandledUpdated => Some(NodeState::Updated),
            HandlerResult::HandledUnchanged => Some(NodeState::Unchanged),
            HandlerResult::Unhandled => None,
        }
    }

    /// Builds a handled result from a "changed" flag.
    pub fn handled(changed: bool) -> Self {
        if changed {
            HandlerResult::HandledUpdated
        } else {
            HandlerResult::HandledUnchanged
        }
    }
}
