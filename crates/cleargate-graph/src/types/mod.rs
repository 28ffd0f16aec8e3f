//! Foundational types for the graph execution model.
//!
//! Graph topology types are `Serialize + Deserialize + Debug + Clone` so
//! graphs can be loaded from JSON and snapshots can be persisted. Map fields
//! that end up in serialized output use `BTreeMap` to keep key order stable.
//!
//! Public enums use `#[non_exhaustive]` so adding variants is never a
//! breaking change for downstream consumers. `NodeExecutionResult` is the
//! exception: handlers match it exhaustively.

pub mod graph;
pub mod result;

pub use graph::*;
pub use result::*;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a single node within one execution context.
///
/// Legal progressions:
///
/// ```text
/// NotStarted -> Running -> Completed | Failed | Suspended
/// Suspended  -> Running | Failed
/// NotStarted -> Skipped
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    NotStarted,
    Running,
    Completed,
    Skipped,
    Failed,
    Suspended,
}

impl NodeState {
    /// `Completed`, `Skipped` and `Failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Suspended, Failed)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Final status of a run that was driven to quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunStatus {
    /// Every reachable node completed or was skipped.
    Completed,
    /// At least one node failed.
    Failed,
}
