//! Built-in node handlers.

pub mod passthrough;
pub mod threshold_router;

pub use passthrough::PassthroughNode;
pub use threshold_router::ThresholdRouterNode;
