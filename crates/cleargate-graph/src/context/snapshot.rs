//! Serializable snapshots of an [`ExecutionContext`] for restart recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::map_run::{ItemOutcome, MapRun};
use super::{ExecutionContext, LedgerEntry, LedgerKey, TagStore};
use crate::errors::StateError;
use crate::registry::GraphRegistry;
use crate::types::{GraphDef, NodeFailure, NodeState};

/// Everything needed to continue a run in another process.
///
/// Storage is up to the caller; the snapshot is plain serde data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub run_id: String,
    pub graph_id: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    pub node_states: BTreeMap<String, NodeState>,
    pub channels: Vec<ChannelEntry>,
    pub tags: Vec<(String, String)>,
    pub ledger: Vec<LedgerRecord>,
    #[serde(default)]
    pub failures: Vec<NodeFailure>,
    /// In-progress Map nodes, keyed by node id.
    #[serde(default)]
    pub maps: BTreeMap<String, MapRunSnapshot>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub node_id: String,
    pub port: u32,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub key: LedgerKey,
    pub entry: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRunSnapshot {
    pub items: Vec<Value>,
    pub outcomes: Vec<Option<ItemOutcome>>,
    /// Parked item sub-contexts, keyed by item index.
    #[serde(default)]
    pub parked: BTreeMap<usize, ExecutionSnapshot>,
}

impl ExecutionContext {
    /// Capture node states, channels, tags, the suspension ledger and Map
    /// progress.
    ///
    /// Take it while the context is not being driven (after cancellation
    /// or once `execute` returned); each store is read under its own lock.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let mut channels: Vec<ChannelEntry> = self
            .channels
            .read()
            .iter()
            .map(|(k, v)| ChannelEntry {
                node_id: k.node_id.clone(),
                port: k.port,
                payload: v.as_ref().clone(),
            })
            .collect();
        channels.sort_by(|a, b| (&a.node_id, a.port).cmp(&(&b.node_id, b.port)));

        let maps = self
            .maps
            .lock()
            .iter()
            .map(|(node_id, run)| {
                let snap = MapRunSnapshot {
                    items: run.items.as_ref().clone(),
                    outcomes: run.outcomes.clone(),
                    parked: run
                        .parked
                        .iter()
                        .map(|(i, ctx)| (*i, ctx.snapshot()))
                        .collect(),
                };
                (node_id.clone(), snap)
            })
            .collect();

        ExecutionSnapshot {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id.clone(),
            input: self.input.as_ref().clone(),
            item_index: self.item_index,
            node_states: self.states.snapshot(),
            channels,
            tags: self.tags.entries(),
            ledger: self
                .ledger
                .entries()
                .into_iter()
                .map(|(key, entry)| LedgerRecord { key, entry })
                .collect(),
            failures: self.failures(),
            maps,
            taken_at: Utc::now(),
        }
    }

    /// Rebuild a context from `snapshot`.
    ///
    /// `graph` must be the graph the snapshot was taken from. Map sub-graphs
    /// are resolved through `graphs`. Edge deliveries are recomputed from
    /// the restored channels, and nodes that were mid-invocation are reset
    /// so the next `execute` re-runs them.
    pub fn restore(
        graph: Arc<GraphDef>,
        snapshot: ExecutionSnapshot,
        graphs: &GraphRegistry,
    ) -> Result<Self, StateError> {
        if snapshot.graph_id != graph.id {
            return Err(StateError::Snapshot {
                message: format!(
                    "snapshot belongs to graph {} but {} was supplied",
                    snapshot.graph_id, graph.id
                ),
            });
        }

        let mut ctx = Self::with_run_id(snapshot.run_id, Arc::clone(&graph), snapshot.input);
        ctx.item_index = snapshot.item_index;
        ctx.tags = TagStore::from_entries(snapshot.tags);

        for (node_id, state) in &snapshot.node_states {
            ctx.states.force(node_id, *state)?;
        }

        for channel in snapshot.channels {
            if graph.node(&channel.node_id).is_none() {
                return Err(StateError::UnknownNode {
                    node_id: channel.node_id,
                });
            }
            ctx.fire(&channel.node_id, channel.port, Arc::new(channel.payload));
        }

        for record in snapshot.ledger {
            ctx.ledger.insert(record.key, record.entry);
        }
        *ctx.failures.lock() = snapshot.failures;

        for (node_id, map) in snapshot.maps {
            let spec = graph
                .node(&node_id)
                .and_then(|n| n.map.as_ref())
                .ok_or_else(|| StateError::UnknownNode {
                    node_id: node_id.clone(),
                })?;
            let sub_graph = graphs.get(&spec.graph_id).ok_or_else(|| StateError::Snapshot {
                message: format!("sub-graph {} is not registered", spec.graph_id),
            })?;
            if map.outcomes.len() != map.items.len() {
                return Err(StateError::Snapshot {
                    message: format!("map {node_id}: outcome count does not match item count"),
                });
            }
            let mut parked = BTreeMap::new();
            for (index, sub) in map.parked {
                let sub_ctx = Self::restore(Arc::clone(&sub_graph), sub, graphs)?;
                parked.insert(index, sub_ctx);
            }
            let run = MapRun::restored(map.items, map.outcomes, parked, spec.max_parallel_tasks);
            ctx.maps.get_mut().insert(node_id, run);
        }

        // Parked-item entries whose sub-context did not survive are re-run
        // from scratch instead.
        let orphans: Vec<LedgerKey> = ctx
            .ledger
            .entries()
            .into_iter()
            .filter_map(|(key, _)| match &key {
                LedgerKey::MapItem { node_id, index } => {
                    let kept = ctx
                        .maps
                        .lock()
                        .get(node_id)
                        .is_some_and(|m| m.parked.contains_key(index));
                    (!kept).then_some(key)
                }
                LedgerKey::Node { .. } => None,
            })
            .collect();
        for key in orphans {
            ctx.ledger.remove(&key);
        }

        ctx.normalize_interrupted();
        tracing::debug!(run_id = %ctx.run_id, graph_id = %graph.id, "context restored");
        Ok(ctx)
    }
}
