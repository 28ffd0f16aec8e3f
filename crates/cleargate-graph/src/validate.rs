use std::collections::{HashMap, HashSet};

use tokio::sync::Semaphore;

use crate::errors::BuildError;
use crate::types::{GraphDef, NodeKind};

/// Validate a `GraphDef` for structural correctness.
///
/// Returns `Ok(())` if the graph is valid, or every problem found.
pub fn validate_graph(graph: &GraphDef) -> Result<(), Vec<BuildError>> {
    let mut errors = Vec::new();

    if graph.nodes.is_empty() {
        return Err(vec![BuildError::EmptyGraph]);
    }

    // 1. Unique ids and per-node shape.
    let mut ports: HashMap<&str, u32> = HashMap::new();
    for node in &graph.nodes {
        if ports.insert(node.id.as_str(), node.output_ports).is_some() {
            errors.push(BuildError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
        if node.output_ports == 0 {
            errors.push(BuildError::ZeroPorts {
                node_id: node.id.clone(),
            });
        }
        match node.kind {
            NodeKind::Handler if node.handler.trim().is_empty() => {
                errors.push(BuildError::MissingHandler {
                    node_id: node.id.clone(),
                });
            }
            NodeKind::Map => match &node.map {
                None => errors.push(BuildError::MissingMapSpec {
                    node_id: node.id.clone(),
                }),
                Some(spec) if spec.graph_id.is_empty() => {
                    errors.push(BuildError::InvalidMapSpec {
                        node_id: node.id.clone(),
                        message: "sub-graph id is empty".into(),
                    });
                }
                Some(spec) if spec.max_parallel_tasks == 0 => {
                    errors.push(BuildError::InvalidMapSpec {
                        node_id: node.id.clone(),
                        message: "max_parallel_tasks must be at least 1".into(),
                    });
                }
                Some(spec) if spec.max_parallel_tasks > Semaphore::MAX_PERMITS => {
                    errors.push(BuildError::InvalidMapSpec {
                        node_id: node.id.clone(),
                        message: format!(
                            "max_parallel_tasks must be at most {}",
                            Semaphore::MAX_PERMITS
                        ),
                    });
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    // 2. Edge endpoints and port ranges.
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ports.contains_key(endpoint.as_str()) {
                errors.push(BuildError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if let Some(&declared) = ports.get(edge.from.as_str()) {
            if edge.from_port >= declared {
                errors.push(BuildError::PortOutOfRange {
                    from: edge.from.clone(),
                    port: edge.from_port,
                    ports: declared,
                });
            }
        }
    }

    // 3. Entry points: Start nodes take no inputs, everything else needs one.
    let has_inbound: HashSet<&str> = graph.edges.iter().map(|e| e.to.as_str()).collect();
    if graph.start_nodes().next().is_none() {
        errors.push(BuildError::NoStartNode);
    }
    for node in &graph.nodes {
        let inbound = has_inbound.contains(node.id.as_str());
        if node.kind == NodeKind::Start {
            if inbound || node.output_ports != 1 {
                errors.push(BuildError::InvalidStart {
                    node_id: node.id.clone(),
                });
            }
        } else if !inbound {
            errors.push(BuildError::Unreachable {
                node_id: node.id.clone(),
            });
        }
    }

    // 4. Acyclic.
    if let Some(node_id) = find_cycle(graph) {
        errors.push(BuildError::Cycle { node_id });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Detect a cycle via DFS. Returns the node the first back-edge points at.
fn find_cycle(graph: &GraphDef) -> Option<String> {
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        outgoing
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    for node in &graph.nodes {
        if let Some(hit) = dfs(node.id.as_str(), &outgoing, &mut visited, &mut in_stack) {
            return Some(hit.to_string());
        }
    }
    None
}

fn dfs<'a>(
    node: &'a str,
    outgoing: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    in_stack: &mut HashSet<&'a str>,
) -> Option<&'a str> {
    if !visited.insert(node) {
        return None;
    }
    in_stack.insert(node);
    if let Some(targets) = outgoing.get(node) {
        for &target in targets {
            if in_stack.contains(target) {
                return Some(target);
            }
            if let Some(hit) = dfs(target, outgoing, visited, in_stack) {
                return Some(hit);
            }
        }
    }
    in_stack.remove(node);
    None
}
