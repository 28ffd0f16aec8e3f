//! Extension points implemented by the host application.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::node_ctx::{NodeCtx, NodeInputs};
use crate::types::NodeExecutionResult;

/// The core abstraction for a unit of work inside a graph.
///
/// Handlers are registered by name in a
/// [`HandlerRegistry`](crate::HandlerRegistry) and referenced from
/// [`NodeDef::handler`](crate::NodeDef). One instance may be invoked
/// concurrently for different nodes and Map items, so implementations
/// must be `Send + Sync` and keep per-invocation state out of `self`.
///
/// `cancel` fires when the run (or the owning Map node) is cancelled.
/// Long-running handlers should watch it and return promptly.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &NodeCtx,
        inputs: NodeInputs,
        cancel: CancellationToken,
    ) -> NodeExecutionResult;
}

/// Decides whether a transient failure is retried and after how long.
///
/// `attempt` is the 1-based number of the invocation that just failed.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32, cause: &str) -> Option<Duration>;
}
