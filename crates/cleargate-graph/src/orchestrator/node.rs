//! Handler invocation: panic isolation, per-invocation timeout and
//! transient retry.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::edges::collect_inputs;
use super::run::{Driver, TaskOutput};
use crate::errors::OrchestratorError;
use crate::node_ctx::{NodeCtx, NodeInputs};
use crate::traits::{NodeHandler, RetryPolicy};
use crate::types::{NodeDef, NodeExecutionResult, Severity};

impl Driver<'_> {
    /// Spawn the handler of `node`. `resume` carries the poll attempt and
    /// token when re-invoking a suspended node.
    pub(super) fn spawn_handler(
        &mut self,
        node: &NodeDef,
        resume: Option<(u32, String)>,
    ) -> Result<(), OrchestratorError> {
        let handler = self.scope.handler(node)?;
        let mut node_ctx = NodeCtx::new(
            self.ctx.run_id(),
            &node.id,
            self.ctx.item_index(),
            Arc::new(node.config.clone()),
            self.ctx.tags().clone(),
        );
        if let Some((attempt, token)) = resume {
            node_ctx = node_ctx.resuming(attempt, token);
        }
        let inputs = collect_inputs(self.ctx, &node.id);
        let timeout = node
            .timeout_ms
            .or(self.scope.config.default_node_timeout_ms)
            .map(Duration::from_millis);
        let retry = self.scope.retry.clone();
        let cancel = self.cancel.clone();
        let node_id = node.id.clone();

        self.tasks.push(tokio::spawn(async move {
            // The retry policy runs outside the per-invocation guard.
            let result = AssertUnwindSafe(invoke_with_retry(
                handler.as_ref(),
                &node_ctx,
                inputs,
                &cancel,
                timeout,
                retry.as_deref(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    run_id = %node_ctx.run_id(),
                    node_id = %node_id,
                    panic = %message,
                    "retry policy panicked"
                );
                NodeExecutionResult::fatal(format!("retry policy panicked: {message}"))
            });
            TaskOutput::Node { node_id, result }
        }));
        Ok(())
    }
}

/// Invoke until the handler stops failing transiently or the retry policy
/// gives up. Without a policy the first transient failure is final.
async fn invoke_with_retry(
    handler: &dyn NodeHandler,
    ctx: &NodeCtx,
    inputs: NodeInputs,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    retry: Option<&dyn RetryPolicy>,
) -> NodeExecutionResult {
    let mut attempt: u32 = 1;
    loop {
        let result = invoke_once(handler, ctx, inputs.clone(), cancel, timeout).await;

        let (Some(policy), NodeExecutionResult::Failure { cause, .. }) = (retry, &result) else {
            return result;
        };
        if !result.is_transient() {
            return result;
        }
        let Some(delay) = policy.next_delay(attempt, cause) else {
            return result;
        };

        tracing::debug!(
            run_id = %ctx.run_id(),
            node_id = %ctx.node_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            cause = %cause,
            "retrying transient failure"
        );
        tokio::select! {
            _ = cancel.cancelled() => return result,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// One invocation. Panics and timeouts become fatal failures.
async fn invoke_once(
    handler: &dyn NodeHandler,
    ctx: &NodeCtx,
    inputs: NodeInputs,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> NodeExecutionResult {
    let started = Instant::now();
    let call = AssertUnwindSafe(handler.execute(ctx, inputs, cancel.clone())).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return NodeExecutionResult::fatal(format!(
                    "timed out after {} ms",
                    limit.as_millis()
                ))
                .with_duration(started.elapsed())
            }
        },
        None => call.await,
    };

    match outcome {
        Ok(result) => result.with_duration(started.elapsed()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                run_id = %ctx.run_id(),
                node_id = %ctx.node_id(),
                panic = %message,
                "handler panicked"
            );
            NodeExecutionResult::Failure {
                cause: format!("handler panicked: {message}"),
                severity: Severity::Fatal,
                duration: started.elapsed(),
            }
        }
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
