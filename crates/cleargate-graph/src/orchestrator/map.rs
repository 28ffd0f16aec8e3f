//! Map nodes: run a sub-graph once per list item with bounded parallelism.
//!
//! Each item drives its own [`ExecutionContext`] in a spawned task that
//! holds one semaphore permit. When an item's sub-run only has suspended
//! work left it parks: the task ends, the permit is released and a
//! `MapItem` ledger entry wakes it again through the parent's shared timer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};

use super::edges::collect_inputs;
use super::node::panic_message;
use super::run::{drive, DriveMode, DriveOutcome, Driver, ItemRun, TaskOutput};
use crate::context::map_run::MapRun;
use crate::context::{ExecutionContext, ItemOutcome, LedgerEntry, LedgerKey};
use crate::errors::{BuildError, OrchestratorError};
use crate::types::*;

impl Driver<'_> {
    /// Split the node's input into items and start them.
    pub(super) fn start_map(&mut self, node: &NodeDef) -> Result<(), OrchestratorError> {
        let spec = map_spec(node)?;
        let mut source = collect_inputs(self.ctx, &node.id).merged();
        if let Some(field) = &spec.items_field {
            source = source.get(field).cloned().unwrap_or(Value::Null);
        }

        let items = match source {
            Value::Array(items) => items,
            other => {
                let kind = match other {
                    Value::Null => "null",
                    Value::Bool(_) => "a boolean",
                    Value::Number(_) => "a number",
                    Value::String(_) => "a string",
                    Value::Object(_) => "an object",
                    Value::Array(_) => "a list",
                };
                return self.fail_node(
                    &node.id,
                    NodeState::Running,
                    format!("map input must be a list, got {kind}"),
                    FailureOrigin::Handler,
                    None,
                );
            }
        };

        if items.is_empty() {
            self.ctx
                .fire(&node.id, 0, Arc::new(json!({ "results": [] })));
            self.ctx
                .transition(&node.id, NodeState::Running, NodeState::Completed)?;
            return Ok(());
        }

        tracing::debug!(
            run_id = %self.ctx.run_id(),
            node_id = %node.id,
            items = items.len(),
            max_parallel = spec.max_parallel_tasks,
            "map started"
        );
        let count = items.len();
        let mut run = MapRun::new(items, spec.max_parallel_tasks.max(1));
        run.rearm(&self.cancel);
        self.ctx.maps().insert(node.id.clone(), run);

        for index in 0..count {
            self.spawn_item(node, index, None)?;
        }
        Ok(())
    }

    /// Pick up Map nodes left `Running` by an earlier drive: re-spawn items
    /// that never finished and make sure every parked item has a wake entry.
    pub(super) fn resume_maps(&mut self) -> Result<(), OrchestratorError> {
        let graph = Arc::clone(self.ctx.graph());
        for node in graph.nodes.iter().filter(|n| n.kind == NodeKind::Map) {
            let (pending, parked, done) = {
                let mut maps = self.ctx.maps();
                let Some(run) = maps.get_mut(&node.id) else {
                    continue;
                };
                run.rearm(&self.cancel);
                let parked: Vec<usize> = run.parked.keys().copied().collect();
                (run.pending(), parked, run.is_done())
            };

            if done {
                self.finish_map(node)?;
                continue;
            }
            for index in parked {
                let key = LedgerKey::map_item(&node.id, index);
                if !self.ctx.ledger().contains(&key) {
                    self.ctx
                        .ledger()
                        .insert(key, LedgerEntry::parked(format!("{}[{index}]", node.id), Utc::now()));
                }
            }
            if !pending.is_empty() {
                tracing::debug!(
                    run_id = %self.ctx.run_id(),
                    node_id = %node.id,
                    items = pending.len(),
                    "resuming map items"
                );
            }
            for index in pending {
                self.spawn_item(node, index, None)?;
            }
        }
        Ok(())
    }

    /// Wake a parked item.
    pub(super) fn resume_item(&mut self, node_id: &str, index: usize) -> Result<(), OrchestratorError> {
        let Some(node) = self.ctx.graph().node(node_id).cloned() else {
            return Ok(());
        };
        let parked = self
            .ctx
            .maps()
            .get_mut(node_id)
            .and_then(|run| run.parked.remove(&index));
        match parked {
            Some(sub) => self.spawn_item(&node, index, Some(sub)),
            // The map finished or halted while the entry was due.
            None => Ok(()),
        }
    }

    fn spawn_item(
        &mut self,
        node: &NodeDef,
        index: usize,
        parked: Option<ExecutionContext>,
    ) -> Result<(), OrchestratorError> {
        let spec = map_spec(node)?;
        let (item, semaphore, item_cancel) = {
            let maps = self.ctx.maps();
            let Some(run) = maps.get(&node.id) else {
                return Ok(());
            };
            (
                run.items.get(index).cloned().unwrap_or(Value::Null),
                Arc::clone(&run.semaphore),
                run.cancel.clone(),
            )
        };

        let sub = match parked {
            Some(sub) => sub,
            None => {
                let graph = self.scope.graph(&spec.graph_id)?;
                let sub = self.ctx.for_item(&node.id, index, graph, item);
                sub.tags()
                    .set(&self.scope.config.map_item_tag, format!("{}[{index}]", node.id));
                sub
            }
        };

        let scope = Arc::clone(&self.scope);
        let node_id = node.id.clone();
        let task = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = item_cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return TaskOutput::MapItem {
                    node_id,
                    index,
                    ctx: sub,
                    run: ItemRun::Cancelled,
                };
            };

            let driven = AssertUnwindSafe(drive(scope, &sub, item_cancel, DriveMode::Nested))
                .catch_unwind()
                .await;
            let run = match driven {
                Ok(Ok(DriveOutcome::Finished(status))) => ItemRun::Finished(status),
                Ok(Ok(DriveOutcome::Parked { wake_at })) => ItemRun::Parked { wake_at },
                Ok(Err(OrchestratorError::Cancelled)) => ItemRun::Cancelled,
                Ok(Err(e)) => ItemRun::Errored(e.to_string()),
                Err(panic) => ItemRun::Errored(format!(
                    "item run panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            TaskOutput::MapItem {
                node_id,
                index,
                ctx: sub,
                run,
            }
        });

        if let Some(run) = self.ctx.maps().get_mut(&node.id) {
            run.aborts.push(task.abort_handle());
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Record what an item task produced and complete the map once every
    /// item has an outcome.
    pub(super) fn on_item_done(
        &mut self,
        node_id: &str,
        index: usize,
        sub: ExecutionContext,
        run: ItemRun,
    ) -> Result<(), OrchestratorError> {
        let Some(node) = self.ctx.graph().node(node_id).cloned() else {
            return Ok(());
        };
        let spec = map_spec(&node)?.clone();

        let (outcome, severity) = match run {
            ItemRun::Cancelled => return Ok(()),
            ItemRun::Parked { wake_at } => {
                let token = sub.run_id().to_string();
                {
                    let mut maps = self.ctx.maps();
                    let Some(map) = maps.get_mut(node_id) else {
                        return Ok(());
                    };
                    map.parked.insert(index, sub);
                }
                self.ctx.ledger().insert(
                    LedgerKey::map_item(node_id, index),
                    LedgerEntry::parked(token, wake_at),
                );
                tracing::debug!(
                    run_id = %self.ctx.run_id(),
                    node_id = %node_id,
                    index,
                    wake_at = %wake_at,
                    "map item parked"
                );
                return Ok(());
            }
            ItemRun::Finished(RunStatus::Completed) => {
                (ItemOutcome::Completed(sub.result_value()), Severity::Fatal)
            }
            ItemRun::Finished(RunStatus::Failed) => {
                let first = sub.failures().into_iter().next();
                let severity = first.as_ref().map_or(Severity::Fatal, |f| f.severity);
                let cause = first.map_or_else(
                    || "item sub-graph failed".to_string(),
                    |f| format!("{}: {}", f.node_id, f.cause),
                );
                (ItemOutcome::Failed(cause), severity)
            }
            ItemRun::Errored(message) => (ItemOutcome::Failed(message), Severity::Fatal),
        };

        let done = {
            let mut maps = self.ctx.maps();
            let Some(map) = maps.get_mut(node_id) else {
                return Ok(());
            };
            if let Some(slot) = map.outcomes.get_mut(index) {
                *slot = Some(outcome.clone());
            }
            map.is_done()
        };

        if let ItemOutcome::Failed(cause) = outcome {
            if spec.error_mode == ErrorMode::HaltOnFailure {
                if let Some(mut map) = self.ctx.maps().remove(node_id) {
                    map.halt();
                }
                self.ctx.ledger().remove_map_items(node_id);
                return self.fail_node(
                    node_id,
                    NodeState::Running,
                    format!("item {index} failed: {cause}"),
                    FailureOrigin::MapItem,
                    Some(index),
                );
            }
            tracing::warn!(
                run_id = %self.ctx.run_id(),
                node_id = %node_id,
                index,
                cause = %cause,
                mode = ?spec.error_mode,
                "map item failed"
            );
            self.ctx.record_failure(NodeFailure {
                node_id: node_id.to_string(),
                item_index: Some(index),
                cause,
                severity,
                origin: FailureOrigin::MapItem,
                contained: true,
            });
        }

        if done {
            self.finish_map(&node)?;
        }
        Ok(())
    }

    /// Fire the aggregated results and complete the node.
    fn finish_map(&mut self, node: &NodeDef) -> Result<(), OrchestratorError> {
        let spec = map_spec(node)?;
        let results = match self.ctx.maps().remove(&node.id) {
            Some(run) => run.results(spec.error_mode),
            None => return Ok(()),
        };
        self.ctx.ledger().remove_map_items(&node.id);
        tracing::debug!(
            run_id = %self.ctx.run_id(),
            node_id = %node.id,
            results = results.len(),
            "map completed"
        );
        self.ctx
            .fire(&node.id, 0, Arc::new(json!({ "results": results })));
        self.ctx
            .transition(&node.id, NodeState::Running, NodeState::Completed)?;
        Ok(())
    }
}

fn map_spec(node: &NodeDef) -> Result<&MapSpec, OrchestratorError> {
    node.map.as_ref().ok_or_else(|| {
        OrchestratorError::Build(BuildError::MissingMapSpec {
            node_id: node.id.clone(),
        })
    })
}
