//! Passthrough node: forwards its inputs on port 0.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::node_ctx::{NodeCtx, NodeInputs};
use crate::traits::NodeHandler;
use crate::types::NodeExecutionResult;

/// Fires its merged inputs unchanged.
///
/// A single input is forwarded as-is; several inputs arrive as an object
/// keyed by source node id. Non-object payloads are wrapped under
/// `"value"`.
pub struct PassthroughNode;

#[async_trait]
impl NodeHandler for PassthroughNode {
    async fn execute(
        &self,
        _ctx: &NodeCtx,
        inputs: NodeInputs,
        _cancel: CancellationToken,
    ) -> NodeExecutionResult {
        NodeExecutionResult::value(inputs.merged())
    }
}
