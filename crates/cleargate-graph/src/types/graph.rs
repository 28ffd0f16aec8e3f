//! Graph schema types: nodes, edges, ports and cloning policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The complete, immutable definition of a graph.
///
/// Build one with [`GraphBuilder`](crate::GraphBuilder) or deserialize it
/// and pass it through [`validate_graph`](crate::validate::validate_graph).
/// Once registered it is shared read-only between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Policy used by edges that do not carry their own override.
    #[serde(default)]
    pub default_cloning: CloningPolicy,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl GraphDef {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Start nodes in declaration order.
    pub fn start_nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Start)
    }

    /// End nodes in declaration order.
    pub fn end_nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::End)
    }

    /// Indices of edges entering `node_id`, in declaration order.
    pub fn inbound(&self, node_id: &str) -> Vec<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.to == node_id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Effective cloning policy for an edge.
    pub fn cloning_for(&self, edge: &Edge) -> CloningPolicy {
        edge.cloning.unwrap_or(self.default_cloning)
    }
}

/// Role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NodeKind {
    /// Receives the run input and fires it on port 0.
    Start,
    /// Collects its inputs as a run output.
    End,
    /// Invokes a registered [`NodeHandler`](crate::NodeHandler).
    Handler,
    /// Runs a sub-graph once per item of its input collection.
    Map,
}

/// Whether fan-out consumers share the producer's payload or get copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloningPolicy {
    /// The first edge (lowest priority) receives the original payload;
    /// every other edge receives an independent copy.
    #[default]
    LazyClone,
    /// Every edge receives an independent copy.
    AlwaysClone,
}

/// How a Map node aggregates item failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// The first failing item stops the remaining items and fails the node.
    #[default]
    HaltOnFailure,
    /// Failing items yield `null` at their index.
    ContinueWithNulls,
    /// Failing items are dropped; survivors keep their relative order.
    ContinueOmitFailures,
}

/// A node in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeDef {
    pub id: String,
    pub kind: NodeKind,
    /// Registered handler name. Empty for Start, End and Map nodes.
    #[serde(default)]
    pub handler: String,
    /// Number of output ports. Default: 1.
    #[serde(default = "default_output_ports")]
    pub output_ports: u32,
    /// Opaque handler configuration, exposed through `NodeCtx::config`.
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapSpec>,
    /// Per-invocation timeout for handler nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_output_ports() -> u32 {
    1
}

impl NodeDef {
    fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handler: String::new(),
            output_ports: default_output_ports(),
            config: Value::Null,
            map: None,
            timeout_ms: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn handler(id: impl Into<String>, handler: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Handler);
        node.handler = handler.into();
        node
    }

    pub fn map(id: impl Into<String>, spec: MapSpec) -> Self {
        let mut node = Self::new(id, NodeKind::Map);
        node.map = Some(spec);
        node
    }

    pub fn with_ports(mut self, ports: u32) -> Self {
        self.output_ports = ports;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Configuration of a Map node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MapSpec {
    /// Id of the sub-graph in the [`GraphRegistry`](crate::GraphRegistry).
    pub graph_id: String,
    /// Upper bound on actively running items. Suspended items do not count.
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Field of the merged input holding the items. `None` means the merged
    /// input itself is the item list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_field: Option<String>,
}

fn default_max_parallel_tasks() -> usize {
    4
}

impl MapSpec {
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            max_parallel_tasks: default_max_parallel_tasks(),
            error_mode: ErrorMode::default(),
            items_field: None,
        }
    }

    pub fn max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = n;
        self
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn items_field(mut self, field: impl Into<String>) -> Self {
        self.items_field = Some(field.into());
        self
    }
}

/// A directed connection from one node's output port to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// 0-based output port on `from`.
    #[serde(default)]
    pub from_port: u32,
    /// Orders edges leaving the same port. Lower goes first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloning: Option<CloningPolicy>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            from_port: 0,
            priority: 0,
            cloning: None,
        }
    }

    pub fn port(mut self, port: u32) -> Self {
        self.from_port = port;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn cloning(mut self, policy: CloningPolicy) -> Self {
        self.cloning = Some(policy);
        self
    }
}
