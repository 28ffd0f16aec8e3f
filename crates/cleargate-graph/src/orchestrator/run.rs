//! Core scheduling loop: readiness, dispatch, the shared wake timer and
//! result application.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::edges::{collect_inputs, dispatch_priority, readiness, Readiness};
use super::RunScope;
use crate::context::{ExecutionContext, LedgerEntry, LedgerKey};
use crate::errors::OrchestratorError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Drive types
// ---------------------------------------------------------------------------

/// How a drive ends when only suspended work is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DriveMode {
    /// Sleep until the next wake and keep going.
    Root,
    /// Hand control back so the caller can free the slot this drive holds.
    Nested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DriveOutcome {
    /// Nothing left to do.
    Finished(RunStatus),
    /// Only suspended work is left; poll again at `wake_at`.
    Parked { wake_at: chrono::DateTime<Utc> },
}

/// What a Map item drive produced.
#[derive(Debug)]
pub(super) enum ItemRun {
    Finished(RunStatus),
    Parked { wake_at: chrono::DateTime<Utc> },
    Cancelled,
    Errored(String),
}

/// Value returned by every spawned task.
pub(super) enum TaskOutput {
    Node {
        node_id: String,
        result: NodeExecutionResult,
    },
    MapItem {
        node_id: String,
        index: usize,
        ctx: ExecutionContext,
        run: ItemRun,
    },
}

/// Drive `ctx` until it finishes, parks (nested only) or is cancelled.
///
/// Boxed because Map items drive their sub-contexts with this same
/// function from inside spawned tasks.
pub(super) fn drive<'a>(
    scope: Arc<RunScope>,
    ctx: &'a ExecutionContext,
    cancel: CancellationToken,
    mode: DriveMode,
) -> BoxFuture<'a, Result<DriveOutcome, OrchestratorError>> {
    async move {
        let mut driver = Driver {
            scope,
            ctx,
            cancel,
            mode,
            tasks: FuturesUnordered::new(),
        };
        driver.run().await
    }
    .boxed()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(super) struct Driver<'a> {
    pub scope: Arc<RunScope>,
    pub ctx: &'a ExecutionContext,
    pub cancel: CancellationToken,
    pub mode: DriveMode,
    pub tasks: FuturesUnordered<JoinHandle<TaskOutput>>,
}

impl Drop for Driver<'_> {
    fn drop(&mut self) {
        // Only non-empty when the drive was cancelled or errored out.
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}

impl<'a> Driver<'a> {
    async fn run(&mut self) -> Result<DriveOutcome, OrchestratorError> {
        self.ctx.normalize_interrupted();
        self.resume_maps()?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            self.poll_due()?;
            self.schedule_ready()?;

            let wake = self.ctx.ledger().next_wake();
            if self.tasks.is_empty() {
                match (wake, self.mode) {
                    (None, _) => return Ok(DriveOutcome::Finished(self.ctx.status())),
                    (Some(wake_at), DriveMode::Nested) => {
                        return Ok(DriveOutcome::Parked { wake_at })
                    }
                    (Some(_), DriveMode::Root) => {}
                }
            }

            let sleep_for = wake.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            if let Some(d) = sleep_for {
                tracing::trace!(run_id = %self.ctx.run_id(), sleep_ms = d.as_millis() as u64, "waiting for next wake");
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                Some(joined) = self.tasks.next(), if !self.tasks.is_empty() => {
                    self.on_task(joined)?;
                }
                _ = tokio::time::sleep(sleep_for.unwrap_or(Duration::ZERO)), if sleep_for.is_some() => {}
            }
        }
    }

    fn cancelled(&self) -> OrchestratorError {
        tracing::debug!(
            run_id = %self.ctx.run_id(),
            in_flight = self.tasks.len(),
            "drive cancelled"
        );
        OrchestratorError::Cancelled
    }

    fn on_task(&mut self, joined: Result<TaskOutput, JoinError>) -> Result<(), OrchestratorError> {
        match joined {
            Ok(TaskOutput::Node { node_id, result }) => self.apply_result(&node_id, result),
            Ok(TaskOutput::MapItem {
                node_id,
                index,
                ctx,
                run,
            }) => self.on_item_done(&node_id, index, ctx, run),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                tracing::warn!(run_id = %self.ctx.run_id(), error = %e, "task failed to join");
                Ok(())
            }
        }
    }

    // -- Scheduling ----------------------------------------------------------

    /// Skip dead nodes and dispatch ready ones until nothing changes.
    fn schedule_ready(&mut self) -> Result<(), OrchestratorError> {
        let graph = Arc::clone(self.ctx.graph());
        loop {
            let mut progressed = false;
            let mut ready: Vec<(i32, usize)> = Vec::new();

            for (position, node) in graph.nodes.iter().enumerate() {
                if self.ctx.node_state(&node.id) != Some(NodeState::NotStarted) {
                    continue;
                }
                if node.kind == NodeKind::Start {
                    ready.push((i32::MIN, position));
                    continue;
                }
                match readiness(self.ctx, &node.id) {
                    Readiness::Pending => {}
                    Readiness::Dead => {
                        self.ctx
                            .transition(&node.id, NodeState::NotStarted, NodeState::Skipped)?;
                        tracing::debug!(run_id = %self.ctx.run_id(), node_id = %node.id, "node skipped");
                        progressed = true;
                    }
                    Readiness::Live => {
                        ready.push((dispatch_priority(self.ctx, &node.id), position));
                    }
                }
            }

            ready.sort_unstable();
            for (_, position) in ready {
                self.dispatch(&graph.nodes[position])?;
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, node: &NodeDef) -> Result<(), OrchestratorError> {
        self.ctx
            .transition(&node.id, NodeState::NotStarted, NodeState::Running)?;
        match node.kind {
            NodeKind::Start => {
                self.ctx.fire(&node.id, 0, Arc::clone(self.ctx.input()));
                self.ctx
                    .transition(&node.id, NodeState::Running, NodeState::Completed)?;
            }
            NodeKind::End => {
                let inputs = collect_inputs(self.ctx, &node.id);
                let payload = match (inputs.len(), inputs.first()) {
                    (1, Some(only)) => Arc::clone(only),
                    _ => Arc::new(inputs.merged()),
                };
                self.ctx.fire(&node.id, 0, payload);
                self.ctx
                    .transition(&node.id, NodeState::Running, NodeState::Completed)?;
            }
            NodeKind::Handler => self.spawn_handler(node, None)?,
            NodeKind::Map => self.start_map(node)?,
        }
        tracing::debug!(run_id = %self.ctx.run_id(), node_id = %node.id, kind = ?node.kind, "node dispatched");
        Ok(())
    }

    // -- Suspension polling --------------------------------------------------

    /// Re-invoke every ledger entry whose time has come, or fail it if its
    /// deadline or retry budget is spent.
    fn poll_due(&mut self) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        for (key, entry) in self.ctx.ledger().claim_due(now) {
            match &key {
                LedgerKey::Node { node_id } => {
                    let attempts = self
                        .ctx
                        .ledger()
                        .update(&key, |e| {
                            e.attempts += 1;
                            e.attempts
                        })
                        .unwrap_or(entry.attempts + 1);
                    let polled = LedgerEntry { attempts, ..entry };

                    if polled.is_exhausted(now) {
                        self.ctx.ledger().remove(&key);
                        let reason = polled.exhausted_reason(now);
                        self.fail_node(
                            node_id,
                            NodeState::Suspended,
                            reason,
                            FailureOrigin::SuspensionTimeout,
                            None,
                        )?;
                        continue;
                    }

                    let Some(node) = self.ctx.graph().node(node_id).cloned() else {
                        self.ctx.ledger().remove(&key);
                        continue;
                    };
                    self.ctx
                        .transition(node_id, NodeState::Suspended, NodeState::Running)?;
                    tracing::debug!(
                        run_id = %self.ctx.run_id(),
                        node_id = %node_id,
                        attempt = attempts,
                        "polling suspended node"
                    );
                    self.spawn_handler(&node, Some((attempts - 1, polled.token)))?;
                }
                LedgerKey::MapItem { node_id, index } => {
                    self.ctx.ledger().remove(&key);
                    self.resume_item(node_id, *index)?;
                }
            }
        }
        Ok(())
    }

    // -- Results -------------------------------------------------------------

    pub(super) fn apply_result(
        &mut self,
        node_id: &str,
        result: NodeExecutionResult,
    ) -> Result<(), OrchestratorError> {
        let key = LedgerKey::node(node_id);
        match result {
            NodeExecutionResult::Success {
                outputs,
                port,
                duration,
            } => {
                let ports = self
                    .ctx
                    .graph()
                    .node(node_id)
                    .map(|n| n.output_ports)
                    .unwrap_or(1);
                self.ctx.ledger().remove(&key);
                if port >= ports {
                    return self.fail_node(
                        node_id,
                        NodeState::Running,
                        format!("fired port {port} but the node declares {ports} port(s)"),
                        FailureOrigin::Handler,
                        None,
                    );
                }
                self.ctx
                    .fire(node_id, port, Arc::new(serde_json::Value::Object(outputs)));
                self.ctx
                    .transition(node_id, NodeState::Running, NodeState::Completed)?;
                tracing::debug!(
                    run_id = %self.ctx.run_id(),
                    node_id = %node_id,
                    port,
                    duration_ms = duration.as_millis() as u64,
                    "node completed"
                );
            }
            NodeExecutionResult::Failure { cause, severity, .. } => {
                self.ctx.ledger().remove(&key);
                let failure = NodeFailure {
                    node_id: node_id.to_string(),
                    item_index: None,
                    cause,
                    severity,
                    origin: FailureOrigin::Handler,
                    contained: false,
                };
                self.ctx
                    .transition(node_id, NodeState::Running, NodeState::Failed)?;
                tracing::warn!(
                    run_id = %self.ctx.run_id(),
                    node_id = %node_id,
                    cause = %failure.cause,
                    severity = ?failure.severity,
                    "node failed"
                );
                self.ctx.record_failure(failure);
            }
            NodeExecutionResult::Suspended(suspension) => {
                let now = Utc::now();
                let rearmed = self
                    .ctx
                    .ledger()
                    .update(&key, |e| e.rearm(&suspension, now))
                    .is_some();
                if !rearmed {
                    self.ctx
                        .ledger()
                        .insert(key, LedgerEntry::first(&suspension, now));
                }
                self.ctx
                    .transition(node_id, NodeState::Running, NodeState::Suspended)?;
                tracing::debug!(
                    run_id = %self.ctx.run_id(),
                    node_id = %node_id,
                    token = %suspension.token,
                    retry_after_ms = suspension.retry_after.as_millis() as u64,
                    message = %suspension.message,
                    "node suspended"
                );
            }
        }
        Ok(())
    }

    /// Mark `node_id` failed from `from` and record why.
    pub(super) fn fail_node(
        &mut self,
        node_id: &str,
        from: NodeState,
        cause: String,
        origin: FailureOrigin,
        item_index: Option<usize>,
    ) -> Result<(), OrchestratorError> {
        self.ctx.transition(node_id, from, NodeState::Failed)?;
        tracing::warn!(
            run_id = %self.ctx.run_id(),
            node_id = %node_id,
            origin = ?origin,
            cause = %cause,
            "node failed"
        );
        self.ctx.record_failure(NodeFailure {
            node_id: node_id.to_string(),
            item_index,
            cause,
            severity: Severity::Fatal,
            origin,
            contained: false,
        });
        Ok(())
    }
}
