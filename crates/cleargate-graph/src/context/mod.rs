//! Per-run mutable state.
//!
//! An [`ExecutionContext`] is bound to one [`GraphDef`] and owned by one
//! run. It holds:
//!
//! - channels: `(node, port)` to the last payload that port fired,
//! - deliveries: the payload each live edge hands to its target,
//! - a [`TagStore`] for correlation and diagnostic tags,
//! - [`NodeStates`] with compare-and-set transitions,
//! - the [`SuspensionLedger`],
//! - Map node bookkeeping and recorded failures.
//!
//! Every store is individually locked so concurrent node completions and
//! handler tag writes stay linearizable. The orchestrator is the only
//! writer of everything except tags.

mod ledger;
pub(crate) mod map_run;
mod snapshot;
mod state;
mod tags;

pub use ledger::{LedgerEntry, LedgerKey, SuspensionLedger};
pub use map_run::ItemOutcome;
pub use snapshot::{ChannelEntry, ExecutionSnapshot, LedgerRecord, MapRunSnapshot};
pub use state::NodeStates;
pub use tags::TagStore;

pub(crate) use ledger::add_std;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StateError;
use crate::types::{GraphDef, NodeFailure, NodeKind, NodeState, RunStatus};

use map_run::MapRun;

/// Address of a channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub node_id: String,
    pub port: u32,
}

impl ChannelKey {
    pub fn new(node_id: impl Into<String>, port: u32) -> Self {
        Self {
            node_id: node_id.into(),
            port,
        }
    }
}

/// Mutable state of a single run.
pub struct ExecutionContext {
    run_id: String,
    graph: Arc<GraphDef>,
    input: Arc<Value>,
    item_index: Option<usize>,
    channels: RwLock<HashMap<ChannelKey, Arc<Value>>>,
    deliveries: RwLock<HashMap<usize, Arc<Value>>>,
    tags: TagStore,
    states: NodeStates,
    ledger: SuspensionLedger,
    failures: Mutex<Vec<NodeFailure>>,
    maps: Mutex<HashMap<String, MapRun>>,
}

impl ExecutionContext {
    /// New context for `graph` with a random run id.
    pub fn new(graph: Arc<GraphDef>, input: Value) -> Self {
        Self::with_run_id(uuid::Uuid::new_v4().to_string(), graph, input)
    }

    pub fn with_run_id(run_id: impl Into<String>, graph: Arc<GraphDef>, input: Value) -> Self {
        let states = NodeStates::new(graph.nodes.iter().map(|n| n.id.as_str()));
        Self {
            run_id: run_id.into(),
            graph,
            input: Arc::new(input),
            item_index: None,
            channels: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
            tags: TagStore::new(),
            states,
            ledger: SuspensionLedger::new(),
            failures: Mutex::new(Vec::new()),
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Sub-context for one Map item. Tags are copied from `self`.
    pub(crate) fn for_item(
        &self,
        map_node: &str,
        index: usize,
        graph: Arc<GraphDef>,
        item: Value,
    ) -> Self {
        let mut ctx = Self::with_run_id(
            format!("{}/{}[{}]", self.run_id, map_node, index),
            graph,
            item,
        );
        ctx.item_index = Some(index);
        ctx.tags = self.tags.fork();
        ctx
    }

    // -- Read access ---------------------------------------------------------

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn graph(&self) -> &Arc<GraphDef> {
        &self.graph
    }

    pub fn input(&self) -> &Arc<Value> {
        &self.input
    }

    /// Index of the Map item this context runs, if it is an item context.
    pub fn item_index(&self) -> Option<usize> {
        self.item_index
    }

    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    pub fn states(&self) -> &NodeStates {
        &self.states
    }

    pub fn ledger(&self) -> &SuspensionLedger {
        &self.ledger
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.states.get(node_id)
    }

    pub fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.states.snapshot()
    }

    /// Payload last written to `(node_id, port)`.
    pub fn channel(&self, node_id: &str, port: u32) -> Option<Arc<Value>> {
        self.channels
            .read()
            .get(&ChannelKey::new(node_id, port))
            .cloned()
    }

    /// Port `node_id` fired, if it completed.
    pub fn fired_port(&self, node_id: &str) -> Option<u32> {
        self.channels
            .read()
            .keys()
            .find(|k| k.node_id == node_id)
            .map(|k| k.port)
    }

    /// Payload delivered along edge `edge_index`.
    pub fn delivery(&self, edge_index: usize) -> Option<Arc<Value>> {
        self.deliveries.read().get(&edge_index).cloned()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.failures.lock().clone()
    }

    /// Payloads of completed End nodes, keyed by node id.
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.graph
            .end_nodes()
            .filter_map(|n| {
                self.channel(&n.id, 0)
                    .map(|payload| (n.id.clone(), payload.as_ref().clone()))
            })
            .collect()
    }

    /// Payload of the first completed End node in declaration order, or
    /// null when none completed.
    pub fn result_value(&self) -> Value {
        self.graph
            .end_nodes()
            .find_map(|n| self.channel(&n.id, 0))
            .map(|payload| payload.as_ref().clone())
            .unwrap_or(Value::Null)
    }

    /// Status of a quiescent run.
    pub fn status(&self) -> RunStatus {
        if self.states.any(NodeState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    // -- Orchestrator writes -------------------------------------------------

    pub(crate) fn transition(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
    ) -> Result<(), StateError> {
        self.states.transition(node_id, from, to)
    }

    /// Record that `node_id` fired `port` with `payload` and store what
    /// each outgoing edge delivers.
    pub(crate) fn fire(&self, node_id: &str, port: u32, payload: Arc<Value>) {
        let routed = crate::orchestrator::route_payload(&self.graph, node_id, port, &payload);
        {
            let mut deliveries = self.deliveries.write();
            for (edge_index, delivered) in routed {
                deliveries.insert(edge_index, delivered);
            }
        }
        self.channels
            .write()
            .insert(ChannelKey::new(node_id, port), payload);
    }

    pub(crate) fn record_failure(&self, failure: NodeFailure) {
        self.failures.lock().push(failure);
    }

    pub(crate) fn maps(&self) -> MutexGuard<'_, HashMap<String, MapRun>> {
        self.maps.lock()
    }

    /// Bring stale in-flight state back to something a fresh drive can
    /// pick up. Only call while no task of this context is running.
    ///
    /// `Running` handler nodes become `Suspended` if they own a ledger
    /// entry and `NotStarted` otherwise. A `Running` Map node without
    /// bookkeeping restarts. Polling marks are cleared.
    pub(crate) fn normalize_interrupted(&self) {
        let maps = self.maps.lock();
        for node in &self.graph.nodes {
            if self.states.get(&node.id) != Some(NodeState::Running) {
                continue;
            }
            let next = match node.kind {
                NodeKind::Map if maps.contains_key(&node.id) => continue,
                NodeKind::Handler if self.ledger.contains(&LedgerKey::node(&node.id)) => {
                    NodeState::Suspended
                }
                _ => NodeState::NotStarted,
            };
            tracing::debug!(run_id = %self.run_id, node_id = %node.id, state = %next, "recovered interrupted node");
            // The node exists because it came from the graph.
            let _ = self.states.force(&node.id, next);
        }
        self.ledger.clear_polling();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("graph_id", &self.graph.id)
            .field("item_index", &self.item_index)
            .field("states", &self.states)
            .field("ledger", &self.ledger)
            .field("tags", &self.tags)
            .finish()
    }
}
