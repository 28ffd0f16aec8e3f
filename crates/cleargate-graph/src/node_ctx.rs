//! Per-invocation context and inputs handed to a [`NodeHandler`].
//!
//! [`NodeHandler`]: crate::traits::NodeHandler

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::TagStore;

// ---------------------------------------------------------------------------
// NodeCtx
// ---------------------------------------------------------------------------

/// What a handler can see about the invocation it is serving.
///
/// Built fresh for every invocation, including every suspension poll.
#[derive(Debug, Clone)]
pub struct NodeCtx {
    run_id: String,
    node_id: String,
    item_index: Option<usize>,
    config: Arc<Value>,
    tags: TagStore,
    poll_attempt: u32,
    resume_token: Option<String>,
}

impl NodeCtx {
    pub(crate) fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        item_index: Option<usize>,
        config: Arc<Value>,
        tags: TagStore,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            item_index,
            config,
            tags,
            poll_attempt: 0,
            resume_token: None,
        }
    }

    pub(crate) fn resuming(mut self, poll_attempt: u32, token: String) -> Self {
        self.poll_attempt = poll_attempt;
        self.resume_token = Some(token);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Index of the Map item being processed, when running inside a Map
    /// sub-graph.
    pub fn item_index(&self) -> Option<usize> {
        self.item_index
    }

    /// The node's `config` from the graph definition.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Run tags. Writes are visible to the orchestrator and other handlers.
    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    /// 0 on the first invocation, then 1, 2, ... on each poll after a
    /// suspension.
    pub fn poll_attempt(&self) -> u32 {
        self.poll_attempt
    }

    /// Token returned with the last `Suspended` result, when polling.
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    pub fn is_resume(&self) -> bool {
        self.resume_token.is_some()
    }
}

// ---------------------------------------------------------------------------
// NodeInputs
// ---------------------------------------------------------------------------

/// Payload arriving over one live inbound edge.
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub from: String,
    pub port: u32,
    pub payload: Arc<Value>,
}

/// Inputs of one invocation, one entry per live inbound edge in edge
/// declaration order.
///
/// Payloads are shared `Arc`s. Under `LazyClone` the first consumer of a
/// port holds the producer's own allocation; use `Arc::make_mut` or
/// [`merged`](Self::merged) to get something mutable.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    inputs: Vec<NodeInput>,
}

impl NodeInputs {
    pub fn new(inputs: Vec<NodeInput>) -> Self {
        Self { inputs }
    }

    /// A single input, as a Start node or a test would provide.
    pub fn single(from: impl Into<String>, payload: Value) -> Self {
        Self::new(vec![NodeInput {
            from: from.into(),
            port: 0,
            payload: Arc::new(payload),
        }])
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInput> {
        self.inputs.iter()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Payload of the first input.
    pub fn first(&self) -> Option<&Arc<Value>> {
        self.inputs.first().map(|i| &i.payload)
    }

    /// Payload arriving from node `from`.
    pub fn get(&self, from: &str) -> Option<&Arc<Value>> {
        self.inputs
            .iter()
            .find(|i| i.from == from)
            .map(|i| &i.payload)
    }

    /// One input unwraps to its payload, several merge into an object keyed
    /// by source node id, none is `null`.
    pub fn merged(&self) -> Value {
        match self.inputs.as_slice() {
            [] => Value::Null,
            [only] => only.payload.as_ref().clone(),
            many => {
                let mut map = Map::new();
                for input in many {
                    map.insert(input.from.clone(), input.payload.as_ref().clone());
                }
                Value::Object(map)
            }
        }
    }

    pub fn into_vec(self) -> Vec<NodeInput> {
        self.inputs
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! Build [`NodeCtx`] instances for handler unit tests.
    //!
    //! ```ignore
    //! let ctx = TestNodeCtx::builder()
    //!     .node_id("sensor")
    //!     .config(json!({"tag": "file_size", "threshold": 1000}))
    //!     .tag("file_size", "500")
    //!     .build();
    //!
    //! let result = handler.execute(&ctx, inputs, CancellationToken::new()).await;
    //! ```

    use std::sync::Arc;

    use serde_json::Value;

    use super::NodeCtx;
    use crate::context::TagStore;

    pub struct TestNodeCtx;

    impl TestNodeCtx {
        pub fn builder() -> TestNodeCtxBuilder {
            TestNodeCtxBuilder {
                run_id: "test-run".into(),
                node_id: "test-node".into(),
                item_index: None,
                config: Value::Null,
                tags: TagStore::new(),
                resume: None,
            }
        }
    }

    pub struct TestNodeCtxBuilder {
        run_id: String,
        node_id: String,
        item_index: Option<usize>,
        config: Value,
        tags: TagStore,
        resume: Option<(u32, String)>,
    }

    impl TestNodeCtxBuilder {
        pub fn run_id(mut self, id: impl Into<String>) -> Self {
            self.run_id = id.into();
            self
        }

        pub fn node_id(mut self, id: impl Into<String>) -> Self {
            self.node_id = id.into();
            self
        }

        pub fn item_index(mut self, index: usize) -> Self {
            self.item_index = Some(index);
            self
        }

        pub fn config(mut self, config: Value) -> Self {
            self.config = config;
            self
        }

        pub fn tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.tags.add(key, value);
            self
        }

        pub fn resume(mut self, poll_attempt: u32, token: impl Into<String>) -> Self {
            self.resume = Some((poll_attempt, token.into()));
            self
        }

        pub fn build(self) -> NodeCtx {
            let ctx = NodeCtx::new(
                self.run_id,
                self.node_id,
                self.item_index,
                Arc::new(self.config),
                self.tags,
            );
            match self.resume {
                Some((attempt, token)) => ctx.resuming(attempt, token),
                None => ctx,
            }
        }
    }
}
