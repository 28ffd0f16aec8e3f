//! Fluent construction of validated [`GraphDef`]s.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::BuildError;
use crate::types::{CloningPolicy, Edge, GraphDef, NodeDef};
use crate::validate::validate_graph;

/// Builder for a [`GraphDef`]. Validation runs in [`build`](Self::build),
/// so a graph that comes out of here satisfies every port and edge rule.
///
/// ```ignore
/// let graph = GraphBuilder::new("ingest")
///     .node(NodeDef::start("start"))
///     .node(NodeDef::handler("sensor", "threshold_router").with_ports(2))
///     .node(NodeDef::end("end"))
///     .edge(Edge::new("start", "sensor"))
///     .edge(Edge::new("sensor", "end").port(1))
///     .build()?;
/// ```
pub struct GraphBuilder {
    id: String,
    name: String,
    nodes: Vec<NodeDef>,
    edges: Vec<Edge>,
    default_cloning: CloningPolicy,
    metadata: BTreeMap<String, Value>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            default_cloning: CloningPolicy::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Shorthand for `edge(Edge::new(from, to).port(port))`.
    pub fn connect(self, from: &str, port: u32, to: &str) -> Self {
        self.edge(Edge::new(from, to).port(port))
    }

    pub fn default_cloning(mut self, policy: CloningPolicy) -> Self {
        self.default_cloning = policy;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Validate and produce the graph.
    pub fn build(self) -> Result<GraphDef, BuildError> {
        let graph = GraphDef {
            id: self.id,
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            default_cloning: self.default_cloning,
            metadata: self.metadata,
        };
        validate_graph(&graph).map_err(|errors| BuildError::from_list(&graph.id, errors))?;
        Ok(graph)
    }
}
