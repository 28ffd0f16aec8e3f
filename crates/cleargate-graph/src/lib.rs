//! Graph workflow orchestration engine.
//!
//! This crate runs directed graphs of handler nodes over JSON payloads. It
//! provides multi-port routing with skip propagation, fan-out with
//! configurable payload sharing, suspend/resume polling driven by a single
//! shared wake timer, Map nodes that run a sub-graph per list item with
//! bounded parallelism, cooperative cancellation and snapshot/restore of
//! in-progress runs.
//!
//! The engine is designed to be embedded in other applications. Node
//! behaviour is supplied by the host through [`NodeHandler`]; persistence
//! of snapshots is up to the caller.

pub mod builder;
pub mod context;
pub mod errors;
pub mod node_ctx;
pub mod nodes;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod traits;
pub mod types;
pub mod validate;

// Re-export public types at the crate level.

// builder
pub use builder::GraphBuilder;

// context
pub use context::{
    ChannelEntry, ChannelKey, ExecutionContext, ExecutionSnapshot, ItemOutcome, LedgerEntry,
    LedgerKey, LedgerRecord, MapRunSnapshot, NodeStates, SuspensionLedger, TagStore,
};

// errors
pub use errors::{BuildError, OrchestratorError, StateError};

// node_ctx
#[cfg(any(test, feature = "test-support"))]
pub use node_ctx::test_support::{TestNodeCtx, TestNodeCtxBuilder};
pub use node_ctx::{NodeCtx, NodeInput, NodeInputs};

// nodes
pub use nodes::{PassthroughNode, ThresholdRouterNode};

// orchestrator
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig, RunOutcome};

// registry
pub use registry::{GraphRegistry, HandlerFactory, HandlerRegistry};

// retry
pub use retry::ExponentialBackoff;

// traits
pub use traits::{NodeHandler, RetryPolicy};

// types
pub use types::*;

// validate
pub use validate::validate_graph;
