//! Threshold router: picks an output port by comparing a number against a
//! threshold.
//!
//! Config:
//!
//! ```json
//! { "tag": "file_size", "threshold": 1000 }
//! { "field": "size", "threshold": 1000 }
//! ```
//!
//! The value is read from the named run tag, or from the named field of
//! the merged input. Values at or above `threshold` fire port 0, values
//! below fire port 1. The merged input is forwarded on whichever port
//! fires. Declare the node with two output ports.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::node_ctx::{NodeCtx, NodeInputs};
use crate::traits::NodeHandler;
use crate::types::NodeExecutionResult;

/// Port fired when the value reaches the threshold.
pub const PORT_AT_OR_ABOVE: u32 = 0;
/// Port fired when the value is below the threshold.
pub const PORT_BELOW: u32 = 1;

#[derive(Debug, Deserialize)]
struct ThresholdConfig {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    field: Option<String>,
    threshold: f64,
}

pub struct ThresholdRouterNode;

impl ThresholdRouterNode {
    fn measure(config: &ThresholdConfig, ctx: &NodeCtx, input: &Value) -> Result<f64, String> {
        match (&config.tag, &config.field) {
            (Some(tag), _) => {
                let raw = ctx
                    .tags()
                    .get(tag)
                    .ok_or_else(|| format!("tag {tag} is not set"))?;
                raw.trim()
                    .parse::<f64>()
                    .map_err(|_| format!("tag {tag} is not numeric: {raw}"))
            }
            (None, Some(field)) => input
                .get(field)
                .and_then(number_of)
                .ok_or_else(|| format!("input field {field} is missing or not numeric")),
            (None, None) => Err("config needs either `tag` or `field`".into()),
        }
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl NodeHandler for ThresholdRouterNode {
    async fn execute(
        &self,
        ctx: &NodeCtx,
        inputs: NodeInputs,
        _cancel: CancellationToken,
    ) -> NodeExecutionResult {
        let config: ThresholdConfig = match serde_json::from_value(ctx.config().clone()) {
            Ok(c) => c,
            Err(e) => return NodeExecutionResult::fatal(format!("invalid threshold config: {e}")),
        };
        let input = inputs.merged();
        let measured = match Self::measure(&config, ctx, &input) {
            Ok(v) => v,
            Err(cause) => return NodeExecutionResult::fatal(cause),
        };

        let port = if measured >= config.threshold {
            PORT_AT_OR_ABOVE
        } else {
            PORT_BELOW
        };
        tracing::debug!(
            node_id = %ctx.node_id(),
            measured,
            threshold = config.threshold,
            port,
            "threshold routed"
        );
        NodeExecutionResult::value(input).on_port(port)
    }
}
