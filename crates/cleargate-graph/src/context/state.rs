//! Per-node lifecycle states with compare-and-set transitions.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::errors::StateError;
use crate::types::NodeState;

/// Node id to [`NodeState`], guarded so that each node's transitions are
/// totally ordered.
#[derive(Default)]
pub struct NodeStates {
    inner: RwLock<HashMap<String, NodeState>>,
}

impl NodeStates {
    /// Every id starts `NotStarted`.
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            inner: RwLock::new(
                ids.into_iter()
                    .map(|id| (id.to_string(), NodeState::NotStarted))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.inner.read().get(node_id).copied()
    }

    /// Move `node_id` from `from` to `to`.
    ///
    /// Fails if the node is not currently `from` or the transition is not
    /// a legal lifecycle step.
    pub fn transition(&self, node_id: &str, from: NodeState, to: NodeState) -> Result<(), StateError> {
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                node_id: node_id.to_string(),
                from,
                to,
            });
        }
        let mut guard = self.inner.write();
        let current = guard
            .get_mut(node_id)
            .ok_or_else(|| StateError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
        if *current != from {
            return Err(StateError::Conflict {
                node_id: node_id.to_string(),
                expected: from,
                actual: *current,
            });
        }
        *current = to;
        Ok(())
    }

    /// Overwrite without lifecycle checks. Used when restoring.
    pub(crate) fn force(&self, node_id: &str, state: NodeState) -> Result<(), StateError> {
        let mut guard = self.inner.write();
        match guard.get_mut(node_id) {
            Some(current) => {
                *current = state;
                Ok(())
            }
            None => Err(StateError::UnknownNode {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Ids currently in `state`, sorted.
    pub fn in_state(&self, state: NodeState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn any(&self, state: NodeState) -> bool {
        self.inner.read().values().any(|s| *s == state)
    }

    pub fn snapshot(&self) -> BTreeMap<String, NodeState> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

impl std::fmt::Debug for NodeStates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
