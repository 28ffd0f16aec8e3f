//! Error types for graph construction, context state and orchestration.

use thiserror::Error;

use crate::types::NodeState;

/// An invalid graph. Reported when a graph is built or registered, never
/// while it runs.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("graph has no nodes")]
    EmptyGraph,
    #[error("duplicate node id: {node_id}")]
    DuplicateNode { node_id: String },
    #[error("edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },
    #[error("edge from {from} uses port {port} but the node declares {ports} port(s)")]
    PortOutOfRange { from: String, port: u32, ports: u32 },
    #[error("node {node_id} declares zero output ports")]
    ZeroPorts { node_id: String },
    #[error("handler node {node_id} has no handler name")]
    MissingHandler { node_id: String },
    #[error("map node {node_id} has no map spec")]
    MissingMapSpec { node_id: String },
    #[error("map node {node_id}: {message}")]
    InvalidMapSpec { node_id: String, message: String },
    #[error("graph has no start node")]
    NoStartNode,
    #[error("start node {node_id} must have exactly one port and no inbound edges")]
    InvalidStart { node_id: String },
    #[error("node {node_id} has no inbound edges")]
    Unreachable { node_id: String },
    #[error("cycle detected through node {node_id}")]
    Cycle { node_id: String },
    #[error("graph {graph_id} is invalid: {}", join_errors(.errors))]
    Invalid {
        graph_id: String,
        errors: Vec<BuildError>,
    },
}

impl BuildError {
    /// Collapse a validation result into a single error.
    pub fn from_list(graph_id: &str, mut errors: Vec<BuildError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Invalid {
                graph_id: graph_id.to_string(),
                errors,
            }
        }
    }
}

fn join_errors(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from [`ExecutionContext`](crate::ExecutionContext) state changes.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("unknown node: {node_id}")]
    UnknownNode { node_id: String },
    #[error("node {node_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        node_id: String,
        from: NodeState,
        to: NodeState,
    },
    #[error("node {node_id} is {actual}, expected {expected}")]
    Conflict {
        node_id: String,
        expected: NodeState,
        actual: NodeState,
    },
    #[error("snapshot error: {message}")]
    Snapshot { message: String },
}

/// Errors from [`Orchestrator`](crate::Orchestrator) runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A node names a handler that is not registered.
    #[error("node {node_id} uses unregistered handler {handler}")]
    UnknownHandler { node_id: String, handler: String },
    /// A Map node references a graph that is not registered.
    #[error("graph not found in registry: {graph_id}")]
    GraphNotFound { graph_id: String },
    /// The run's cancellation token fired. The context keeps whatever
    /// state it had reached.
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    State(#[from] StateError),
}
