//! Bookkeeping for a Map node while its items are in progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::ExecutionContext;
use crate::types::ErrorMode;

/// Final outcome of one Map item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "value")]
pub enum ItemOutcome {
    Completed(Value),
    Failed(String),
}

/// Live state of a Map node between its start and its final result.
pub(crate) struct MapRun {
    pub items: Arc<Vec<Value>>,
    pub outcomes: Vec<Option<ItemOutcome>>,
    /// Sub-contexts of items that suspended and gave up their slot.
    pub parked: BTreeMap<usize, ExecutionContext>,
    pub max_parallel: usize,
    pub semaphore: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub aborts: Vec<AbortHandle>,
}

impl MapRun {
    pub fn new(items: Vec<Value>, max_parallel: usize) -> Self {
        let outcomes = vec![None; items.len()];
        Self::restored(items, outcomes, BTreeMap::new(), max_parallel)
    }

    pub fn restored(
        items: Vec<Value>,
        outcomes: Vec<Option<ItemOutcome>>,
        parked: BTreeMap<usize, ExecutionContext>,
        max_parallel: usize,
    ) -> Self {
        let max_parallel = max_parallel.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            items: Arc::new(items),
            outcomes,
            parked,
            max_parallel,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            cancel: CancellationToken::new(),
            aborts: Vec::new(),
        }
    }

    /// Fresh slots and a new cancellation scope under `parent`. Only valid
    /// while no item task of this map is in flight.
    pub fn rearm(&mut self, parent: &CancellationToken) {
        self.semaphore = Arc::new(Semaphore::new(self.max_parallel));
        self.cancel = parent.child_token();
        self.aborts.clear();
    }

    /// Items with no outcome that are not parked.
    pub fn pending(&self) -> Vec<usize> {
        (0..self.items.len())
            .filter(|i| self.outcomes[*i].is_none() && !self.parked.contains_key(i))
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.outcomes.iter().all(Option::is_some)
    }

    /// Stop every item of this map.
    pub fn halt(&mut self) {
        self.cancel.cancel();
        for handle in self.aborts.drain(..) {
            handle.abort();
        }
        self.parked.clear();
    }

    /// Final result list under `mode`. Only meaningful once
    /// [`is_done`](Self::is_done).
    pub fn results(&self, mode: ErrorMode) -> Vec<Value> {
        let outcomes = self.outcomes.iter().flatten();
        match mode {
            ErrorMode::ContinueOmitFailures => outcomes
                .filter_map(|o| match o {
                    ItemOutcome::Completed(v) => Some(v.clone()),
                    ItemOutcome::Failed(_) => None,
                })
                .collect(),
            ErrorMode::ContinueWithNulls | ErrorMode::HaltOnFailure => outcomes
                .map(|o| match o {
                    ItemOutcome::Completed(v) => v.clone(),
                    ItemOutcome::Failed(_) => Value::Null,
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for MapRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRun")
            .field("items", &self.items.len())
            .field("outcomes", &self.outcomes)
            .field("parked", &self.parked.keys().collect::<Vec<_>>())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}
