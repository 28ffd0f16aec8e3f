//! Edge resolution: readiness, input collection and fan-out routing.

use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::node_ctx::{NodeInput, NodeInputs};
use crate::types::{CloningPolicy, Edge, GraphDef, NodeState};

/// Where a node stands with respect to its inbound edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Readiness {
    /// Some source has not resolved yet.
    Pending,
    /// Every edge resolved and at least one delivered a payload.
    Live,
    /// Every edge resolved and none delivered.
    Dead,
}

/// Resolution of a single edge.
fn edge_status(ctx: &ExecutionContext, edge: &Edge) -> Readiness {
    match ctx.node_state(&edge.from) {
        Some(NodeState::Completed) if ctx.fired_port(&edge.from) == Some(edge.from_port) => {
            Readiness::Live
        }
        Some(NodeState::Completed | NodeState::Skipped | NodeState::Failed) => Readiness::Dead,
        _ => Readiness::Pending,
    }
}

/// A node is ready once every inbound edge is resolved. It runs if at
/// least one edge is live and is skipped if all are dead.
pub(super) fn readiness(ctx: &ExecutionContext, node_id: &str) -> Readiness {
    let graph = ctx.graph();
    let mut any_live = false;
    for index in graph.inbound(node_id) {
        match edge_status(ctx, &graph.edges[index]) {
            Readiness::Pending => return Readiness::Pending,
            Readiness::Live => any_live = true,
            Readiness::Dead => {}
        }
    }
    if any_live {
        Readiness::Live
    } else {
        Readiness::Dead
    }
}

/// Payloads delivered to `node_id`, in edge declaration order.
pub(super) fn collect_inputs(ctx: &ExecutionContext, node_id: &str) -> NodeInputs {
    let graph = ctx.graph();
    let inputs = graph
        .inbound(node_id)
        .into_iter()
        .filter_map(|index| {
            let edge = &graph.edges[index];
            ctx.delivery(index).map(|payload| NodeInput {
                from: edge.from.clone(),
                port: edge.from_port,
                payload,
            })
        })
        .collect();
    NodeInputs::new(inputs)
}

/// Lowest priority among the live edges into `node_id`. Ready nodes are
/// dispatched in this order.
pub(super) fn dispatch_priority(ctx: &ExecutionContext, node_id: &str) -> i32 {
    let graph = ctx.graph();
    graph
        .inbound(node_id)
        .into_iter()
        .filter(|index| ctx.delivery(*index).is_some())
        .map(|index| graph.edges[index].priority)
        .min()
        .unwrap_or(i32::MAX)
}

/// Work out what each edge leaving `(node_id, port)` delivers.
///
/// Edges are ordered by `(priority, declaration index)`. Under
/// [`CloningPolicy::LazyClone`] the first edge shares `payload`; every other
/// edge, and every edge under [`CloningPolicy::AlwaysClone`], gets a deep
/// copy.
pub(crate) fn route_payload(
    graph: &GraphDef,
    node_id: &str,
    port: u32,
    payload: &Arc<Value>,
) -> Vec<(usize, Arc<Value>)> {
    let mut edges: Vec<(usize, &Edge)> = graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| e.from == node_id && e.from_port == port)
        .collect();
    edges.sort_by_key(|(index, e)| (e.priority, *index));

    edges
        .into_iter()
        .enumerate()
        .map(|(rank, (index, edge))| {
            let share = rank == 0 && graph.cloning_for(edge) == CloningPolicy::LazyClone;
            let delivered = if share {
                Arc::clone(payload)
            } else {
                Arc::new(payload.as_ref().clone())
            };
            (index, delivered)
        })
        .collect()
}
