//! Results returned by node handlers and failures recorded by the orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How bad a handler failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Terminal for the node.
    Fatal,
    /// May be retried when the orchestrator has a retry policy.
    Transient,
}

/// Outcome of one handler invocation.
///
/// `duration` is stamped by the orchestrator; handlers can leave it at zero.
/// The variant set is closed, so callers can match it exhaustively:
///
/// ```
/// use cleargate_graph::NodeExecutionResult;
///
/// fn describe(result: &NodeExecutionResult) -> &'static str {
///     match result {
///         NodeExecutionResult::Success { .. } => "success",
///         NodeExecutionResult::Failure { .. } => "failure",
///         NodeExecutionResult::Suspended(_) => "suspended",
///     }
/// }
///
/// assert_eq!(describe(&NodeExecutionResult::fatal("disk full")), "failure");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum NodeExecutionResult {
    /// The handler produced `outputs` and fired `port`.
    Success {
        outputs: Map<String, Value>,
        port: u32,
        duration: Duration,
    },
    Failure {
        cause: String,
        severity: Severity,
        duration: Duration,
    },
    /// The handler wants to be invoked again later.
    Suspended(Suspension),
}

impl NodeExecutionResult {
    /// Success on port 0.
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self::Success {
            outputs,
            port: 0,
            duration: Duration::ZERO,
        }
    }

    /// Success carrying a single value. Objects are used as the outputs map
    /// directly, anything else is stored under `"value"`.
    pub fn value(value: Value) -> Self {
        let outputs = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self::success(outputs)
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self::Failure {
            cause: cause.into(),
            severity: Severity::Fatal,
            duration: Duration::ZERO,
        }
    }

    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Failure {
            cause: cause.into(),
            severity: Severity::Transient,
            duration: Duration::ZERO,
        }
    }

    pub fn suspend(suspension: Suspension) -> Self {
        Self::Suspended(suspension)
    }

    /// Fire a different port. No effect on non-success results.
    pub fn on_port(mut self, port: u32) -> Self {
        if let Self::Success { port: p, .. } = &mut self {
            *p = port;
        }
        self
    }

    /// Overwrite the duration of a success or failure.
    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        match &mut self {
            Self::Success { duration, .. } | Self::Failure { duration, .. } => *duration = elapsed,
            Self::Suspended(_) => {}
        }
        self
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                severity: Severity::Transient,
                ..
            }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<Suspension> for NodeExecutionResult {
    fn from(s: Suspension) -> Self {
        Self::Suspended(s)
    }
}

/// A handler's request to be polled again.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    /// Opaque token handed back to the handler on the next poll.
    pub token: String,
    pub retry_after: Duration,
    /// Give up this long after the first suspension.
    pub max_wait_time: Option<Duration>,
    /// Give up once the poll count exceeds this.
    pub max_retries: Option<u32>,
    pub message: String,
}

impl Suspension {
    pub fn new(token: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            token: token.into(),
            retry_after,
            max_wait_time: None,
            max_retries: None,
            message: String::new(),
        }
    }

    pub fn max_wait_time(mut self, max_wait: Duration) -> Self {
        self.max_wait_time = Some(max_wait);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Recorded failures
// ---------------------------------------------------------------------------

/// Where a recorded failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FailureOrigin {
    /// Returned by the handler (including timeouts and panics).
    Handler,
    /// Synthesized when a suspension ran out of time or retries.
    SuspensionTimeout,
    /// A Map item failed.
    MapItem,
}

/// A failure recorded against a node of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    /// Set for failures of a single Map item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    pub cause: String,
    pub severity: Severity,
    pub origin: FailureOrigin,
    /// `true` when a Map error mode absorbed the failure.
    #[serde(default)]
    pub contained: bool,
}
