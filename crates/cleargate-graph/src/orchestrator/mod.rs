//! Graph orchestrator: the scheduler at the core of the crate.
//!
//! Runs a graph as a set of tokio tasks over one [`ExecutionContext`]:
//! ready nodes are dispatched concurrently, results are routed through
//! port-qualified channels, dead branches are skipped, suspended nodes are
//! parked in the suspension ledger and polled from a single shared wake
//! timer, and Map nodes fan out over a sub-graph with bounded parallelism.

mod edges;
mod map;
mod node;
mod run;

pub(crate) use edges::route_payload;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{ExecutionContext, ExecutionSnapshot};
use crate::errors::{BuildError, OrchestratorError};
use crate::registry::{GraphRegistry, HandlerRegistry};
use crate::traits::{NodeHandler, RetryPolicy};
use crate::types::*;
use crate::validate::validate_graph;

use run::{drive, DriveMode, DriveOutcome};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Timeout for a single handler invocation when the node sets none.
    #[serde(default)]
    pub default_node_timeout_ms: Option<u64>,
    /// Tag seeded with the run id when absent. Default: `lib:correlation_id`.
    #[serde(default = "default_correlation_tag")]
    pub correlation_tag: String,
    /// Tag set on every Map item sub-context. Default: `lib:map_item`.
    #[serde(default = "default_map_item_tag")]
    pub map_item_tag: String,
}

fn default_correlation_tag() -> String {
    "lib:correlation_id".into()
}

fn default_map_item_tag() -> String {
    "lib:map_item".into()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: None,
            correlation_tag: default_correlation_tag(),
            map_item_tag: default_map_item_tag(),
        }
    }
}

/// Summary of a run that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Payload of every completed End node, keyed by node id.
    pub outputs: BTreeMap<String, Value>,
    /// Every recorded failure, including ones contained by a Map node.
    pub failures: Vec<NodeFailure>,
    pub node_states: BTreeMap<String, NodeState>,
    /// Wall time of this `execute` call.
    pub duration: Duration,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Payload of End node `node_id`.
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }
}

// ---------------------------------------------------------------------------
// Run scope
// ---------------------------------------------------------------------------

/// Handlers and sub-graphs resolved once before a run starts.
pub(crate) struct RunScope {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
    graphs: HashMap<String, Arc<GraphDef>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    config: OrchestratorConfig,
}

impl RunScope {
    /// Walk `root` and every Map sub-graph it reaches.
    fn resolve(root: &Arc<GraphDef>, orchestrator: &Orchestrator) -> Result<Self, OrchestratorError> {
        let mut scope = Self {
            handlers: HashMap::new(),
            graphs: HashMap::new(),
            retry: orchestrator.retry.clone(),
            config: orchestrator.config.clone(),
        };
        // A Map node may run the root graph itself.
        scope.graphs.insert(root.id.clone(), Arc::clone(root));
        let mut seen: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut queue: VecDeque<Arc<GraphDef>> = VecDeque::from([Arc::clone(root)]);

        while let Some(graph) = queue.pop_front() {
            for node in &graph.nodes {
                match node.kind {
                    NodeKind::Handler => {
                        if scope.handlers.contains_key(&node.handler) {
                            continue;
                        }
                        let handler = orchestrator.handlers.create(&node.handler).ok_or_else(|| {
                            OrchestratorError::UnknownHandler {
                                node_id: node.id.clone(),
                                handler: node.handler.clone(),
                            }
                        })?;
                        scope.handlers.insert(node.handler.clone(), handler);
                    }
                    NodeKind::Map => {
                        let Some(spec) = &node.map else { continue };
                        if !seen.insert(spec.graph_id.clone()) {
                            continue;
                        }
                        let sub = orchestrator.graphs.get(&spec.graph_id).ok_or_else(|| {
                            OrchestratorError::GraphNotFound {
                                graph_id: spec.graph_id.clone(),
                            }
                        })?;
                        scope.graphs.insert(spec.graph_id.clone(), Arc::clone(&sub));
                        queue.push_back(sub);
                    }
                    NodeKind::Start | NodeKind::End => {}
                }
            }
        }
        Ok(scope)
    }

    fn handler(&self, node: &NodeDef) -> Result<Arc<dyn NodeHandler>, OrchestratorError> {
        self.handlers
            .get(&node.handler)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownHandler {
                node_id: node.id.clone(),
                handler: node.handler.clone(),
            })
    }

    fn graph(&self, graph_id: &str) -> Result<Arc<GraphDef>, OrchestratorError> {
        self.graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::GraphNotFound {
                graph_id: graph_id.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes graphs against [`ExecutionContext`]s.
///
/// Cheap to clone; registries are shared.
#[derive(Clone)]
pub struct Orchestrator {
    graphs: GraphRegistry,
    handlers: HandlerRegistry,
    retry: Option<Arc<dyn RetryPolicy>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive `ctx` until every reachable node is terminal.
    ///
    /// Returns [`OrchestratorError::Cancelled`] if `cancel` fires first; the
    /// context then keeps nodes in `Running` or `Suspended` and can be
    /// snapshotted or executed again. Calling `execute` on a context that
    /// already finished returns its outcome without invoking anything.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let started = Instant::now();
        let graph = ctx.graph();
        validate_graph(graph).map_err(|errors| BuildError::from_list(&graph.id, errors))?;
        let scope = Arc::new(RunScope::resolve(graph, self)?);

        ctx.tags()
            .add_if_absent(&self.config.correlation_tag, ctx.run_id());
        tracing::info!(
            run_id = %ctx.run_id(),
            graph_id = %graph.id,
            nodes = graph.nodes.len(),
            "run started"
        );

        let status = match drive(scope, ctx, cancel.clone(), DriveMode::Root).await {
            Ok(DriveOutcome::Finished(status)) => status,
            // Root drives sleep through suspensions instead of parking.
            Ok(DriveOutcome::Parked { .. }) => ctx.status(),
            Err(e) => {
                match &e {
                    OrchestratorError::Cancelled => tracing::info!(
                        run_id = %ctx.run_id(),
                        suspended = ctx.ledger().len(),
                        "run cancelled"
                    ),
                    other => tracing::warn!(run_id = %ctx.run_id(), error = %other, "run aborted"),
                }
                return Err(e);
            }
        };

        let outcome = RunOutcome {
            run_id: ctx.run_id().to_string(),
            status,
            outputs: ctx.outputs(),
            failures: ctx.failures(),
            node_states: ctx.node_states(),
            duration: started.elapsed(),
        };
        tracing::info!(
            run_id = %outcome.run_id,
            status = ?outcome.status,
            failures = outcome.failures.len(),
            duration_ms = outcome.duration.as_millis() as u64,
            "run finished"
        );
        Ok(outcome)
    }

    /// Create a context for registered graph `graph_id` and run it to the
    /// end.
    pub async fn run(
        &self,
        graph_id: &str,
        input: Value,
    ) -> Result<(RunOutcome, ExecutionContext), OrchestratorError> {
        let graph = self
            .graphs
            .get(graph_id)
            .ok_or_else(|| OrchestratorError::GraphNotFound {
                graph_id: graph_id.to_string(),
            })?;
        let ctx = ExecutionContext::new(graph, input);
        let outcome = self.execute(&ctx, &CancellationToken::new()).await?;
        Ok((outcome, ctx))
    }

    /// Rebuild a context from `snapshot` using the registered graph it was
    /// taken from.
    pub fn restore(&self, snapshot: ExecutionSnapshot) -> Result<ExecutionContext, OrchestratorError> {
        let graph = self.graphs.get(&snapshot.graph_id).ok_or_else(|| {
            OrchestratorError::GraphNotFound {
                graph_id: snapshot.graph_id.clone(),
            }
        })?;
        Ok(ExecutionContext::restore(graph, snapshot, &self.graphs)?)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graphs", &self.graphs)
            .field("handlers", &self.handlers.names())
            .field("retry", &self.retry.is_some())
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    graphs: GraphRegistry,
    handlers: HandlerRegistry,
    retry: Option<Arc<dyn RetryPolicy>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Use an existing graph registry.
    pub fn graphs(mut self, graphs: GraphRegistry) -> Self {
        self.graphs = graphs;
        self
    }

    /// Use an existing handler registry.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register a handler instance under `name`.
    pub fn handler(self, name: impl Into<String>, handler: impl NodeHandler + 'static) -> Self {
        self.handlers.register(name, Arc::new(handler));
        self
    }

    /// Register a per-run handler factory under `name`.
    pub fn handler_factory<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn NodeHandler> + Send + Sync + 'static,
    {
        self.handlers.register_factory(name, factory);
        self
    }

    /// Register the built-in handlers under `passthrough` and
    /// `threshold_router`.
    pub fn builtin_nodes(self) -> Self {
        self.handler("passthrough", crate::nodes::PassthroughNode)
            .handler("threshold_router", crate::nodes::ThresholdRouterNode)
    }

    /// Retry transient failures with `policy`.
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            graphs: self.graphs,
            handlers: self.handlers,
            retry: self.retry,
            config: self.config,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::node_ctx::{NodeCtx, NodeInputs};
    use crate::retry::ExponentialBackoff;
    use crate::GraphBuilder;

    // -- Mock node handlers -------------------------------------------------

    /// Records the input `Arc` it received.
    struct Recorder(Arc<Mutex<Vec<Arc<Value>>>>);

    #[async_trait]
    impl NodeHandler for Recorder {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            if let Some(first) = inputs.first() {
                self.0.lock().push(Arc::clone(first));
            }
            NodeExecutionResult::value(json!({"seen": true}))
        }
    }

    /// Suspends until it has been polled `polls` times, then returns the item.
    struct Poller {
        polls: u32,
        retry_after: Duration,
        log: Arc<Mutex<Vec<(Value, u32)>>>,
    }

    #[async_trait]
    impl NodeHandler for Poller {
        async fn execute(
            &self,
            ctx: &NodeCtx,
            inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            let item = inputs.merged();
            let attempt = ctx.poll_attempt();
            self.log.lock().push((item.clone(), attempt));
            if attempt < self.polls {
                return Suspension::new(format!("tok-{attempt}"), self.retry_after).into();
            }
            NodeExecutionResult::value(json!({"item": item, "polls": attempt}))
        }
    }

    /// Suspends on every call.
    struct Stuck {
        suspension: Suspension,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NodeHandler for Stuck {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            _inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.suspension.clone().into()
        }
    }

    /// `"bad"` fails, `"slow"` suspends with a short deadline, anything
    /// else is returned.
    struct Picky;

    #[async_trait]
    impl NodeHandler for Picky {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            let item = inputs.merged();
            match item.as_str() {
                Some("bad") => NodeExecutionResult::fatal("bad item"),
                Some("slow") => Suspension::new("slow", Duration::from_millis(20))
                    .max_wait_time(Duration::from_millis(120))
                    .into(),
                _ => NodeExecutionResult::value(item),
            }
        }
    }

    /// Fails transiently `fail_times` times, then succeeds.
    struct Flaky {
        fail_times: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NodeHandler for Flaky {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            _inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                NodeExecutionResult::transient("connection reset")
            } else {
                NodeExecutionResult::value(json!({"call": call}))
            }
        }
    }

    /// Sleeps, watching cancellation.
    struct Sleeper(Duration);

    #[async_trait]
    impl NodeHandler for Sleeper {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            _inputs: NodeInputs,
            cancel: CancellationToken,
        ) -> NodeExecutionResult {
            tokio::select! {
                _ = cancel.cancelled() => NodeExecutionResult::fatal("cancelled"),
                _ = tokio::time::sleep(self.0) => NodeExecutionResult::value(json!("slept")),
            }
        }
    }

    struct Panicker;

    #[async_trait]
    impl NodeHandler for Panicker {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            _inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            panic!("boom")
        }
    }

    struct WrongPort;

    #[async_trait]
    impl NodeHandler for WrongPort {
        async fn execute(
            &self,
            _ctx: &NodeCtx,
            _inputs: NodeInputs,
            _cancel: CancellationToken,
        ) -> NodeExecutionResult {
            NodeExecutionResult::value(json!({})).on_port(5)
        }
    }

    /// Panics when asked for a retry delay.
    struct PanickingPolicy;

    impl RetryPolicy for PanickingPolicy {
        fn next_delay(&self, _attempt: u32, _cause: &str) -> Option<Duration> {
            panic!("policy exploded")
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn make_graph_linear(handler: &str) -> GraphDef {
        GraphBuilder::new("linear")
            .node(NodeDef::start("start"))
            .node(NodeDef::handler("work", handler))
            .node(NodeDef::end("end"))
            .connect("start", 0, "work")
            .connect("work", 0, "end")
            .build()
            .unwrap()
    }

    fn make_graph_item(handler: &str) -> GraphDef {
        GraphBuilder::new("item")
            .node(NodeDef::start("start"))
            .node(NodeDef::handler("step", handler))
            .node(NodeDef::end("end"))
            .connect("start", 0, "step")
            .connect("step", 0, "end")
            .build()
            .unwrap()
    }

    fn make_graph_map(spec: MapSpec) -> GraphDef {
        GraphBuilder::new("mapper")
            .node(NodeDef::start("start"))
            .node(NodeDef::map("fan", spec))
            .node(NodeDef::end("end"))
            .connect("start", 0, "fan")
            .connect("fan", 0, "end")
            .build()
            .unwrap()
    }

    fn make_orchestrator(graphs: Vec<GraphDef>, builder: OrchestratorBuilder) -> Orchestrator {
        let registry = GraphRegistry::new();
        for graph in graphs {
            registry.register(graph.id.clone(), graph).unwrap();
        }
        builder.graphs(registry).build()
    }

    fn results(outcome: &RunOutcome) -> Vec<Value> {
        outcome.output("end").unwrap()["results"]
            .as_array()
            .unwrap()
            .clone()
    }

    // -- Routing ------------------------------------------------------------

    #[tokio::test]
    async fn small_file_takes_the_small_branch() {
        let graph = GraphBuilder::new("sensor")
            .node(NodeDef::start("start"))
            .node(
                NodeDef::handler("sensor", "threshold_router")
                    .with_ports(2)
                    .with_config(json!({"tag": "file_size", "threshold": 1000})),
            )
            .node(NodeDef::handler("process_large", "passthrough"))
            .node(NodeDef::handler("archive_large", "passthrough"))
            .node(NodeDef::handler("process_small", "passthrough"))
            .node(NodeDef::end("end"))
            .connect("start", 0, "sensor")
            .connect("sensor", 0, "process_large")
            .connect("process_large", 0, "archive_large")
            .connect("sensor", 1, "process_small")
            .connect("archive_large", 0, "end")
            .connect("process_small", 0, "end")
            .build()
            .unwrap();
        let orch = make_orchestrator(vec![graph], Orchestrator::builder().builtin_nodes());

        let ctx = ExecutionContext::new(orch.graphs().get("sensor").unwrap(), json!({"file": "a.bin"}));
        ctx.tags().add("file_size", "500");
        let outcome = orch.execute(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(ctx.fired_port("sensor"), Some(1));
        assert_eq!(ctx.node_state("process_small"), Some(NodeState::Completed));
        assert_eq!(ctx.node_state("process_large"), Some(NodeState::Skipped));
        assert_eq!(ctx.node_state("archive_large"), Some(NodeState::Skipped));
        assert_eq!(ctx.node_state("end"), Some(NodeState::Completed));
        assert_eq!(outcome.output("end"), Some(&json!({"file": "a.bin"})));
        assert_eq!(
            ctx.tags().get("lib:correlation_id").as_deref(),
            Some(ctx.run_id())
        );
    }

    #[tokio::test]
    async fn first_edge_shares_and_others_get_copies() {
        let seen_first = Arc::new(Mutex::new(Vec::new()));
        let seen_second = Arc::new(Mutex::new(Vec::new()));
        let graph = GraphBuilder::new("fanout")
            .node(NodeDef::start("start"))
            .node(NodeDef::handler("producer", "passthrough"))
            .node(NodeDef::handler("a", "first"))
            .node(NodeDef::handler("b", "second"))
            .node(NodeDef::end("end"))
            .connect("start", 0, "producer")
            .edge(Edge::new("producer", "b").priority(2))
            .edge(Edge::new("producer", "a").priority(1))
            .connect("a", 0, "end")
            .connect("b", 0, "end")
            .build()
            .unwrap();
        let orch = make_orchestrator(
            vec![graph],
            Orchestrator::builder()
                .builtin_nodes()
                .handler("first", Recorder(Arc::clone(&seen_first)))
                .handler("second", Recorder(Arc::clone(&seen_second))),
        );

        let (outcome, ctx) = orch.run("fanout", json!({"rows": [1, 2, 3]})).await.unwrap();
        assert!(outcome.is_completed());

        let produced = ctx.channel("producer", 0).unwrap();
        let first = seen_first.lock()[0].clone();
        let second = seen_second.lock()[0].clone();
        assert!(Arc::ptr_eq(&first, &produced));
        assert!(!Arc::ptr_eq(&second, &produced));
        assert_eq!(*second, *produced);
    }

    #[tokio::test]
    async fn out_of_range_port_fails_the_node() {
        let orch = make_orchestrator(
            vec![make_graph_linear("wrong_port")],
            Orchestrator::builder().handler("wrong_port", WrongPort),
        );
        let (outcome, ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(ctx.node_state("work"), Some(NodeState::Failed));
        assert_eq!(ctx.node_state("end"), Some(NodeState::Skipped));
    }

    // -- Failures -----------------------------------------------------------

    #[tokio::test]
    async fn panic_becomes_fatal_failure() {
        let orch = make_orchestrator(
            vec![make_graph_linear("panics")],
            Orchestrator::builder().handler("panics", Panicker),
        );
        let (outcome, _ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].node_id, "work");
        assert!(outcome.failures[0].cause.contains("panicked: boom"));
        assert_eq!(outcome.failures[0].severity, Severity::Fatal);
    }

    #[tokio::test]
    async fn invocation_timeout_is_fatal() {
        let graph = GraphBuilder::new("slow")
            .node(NodeDef::start("start"))
            .node(NodeDef::handler("work", "sleep").with_timeout_ms(20))
            .node(NodeDef::end("end"))
            .connect("start", 0, "work")
            .connect("work", 0, "end")
            .build()
            .unwrap();
        let orch = make_orchestrator(
            vec![graph],
            Orchestrator::builder().handler("sleep", Sleeper(Duration::from_secs(5))),
        );
        let (outcome, _ctx) = orch.run("slow", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failures[0].cause, "timed out after 20 ms");
    }

    #[tokio::test]
    async fn transient_failure_retries_with_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![make_graph_linear("flaky")],
            Orchestrator::builder()
                .handler(
                    "flaky",
                    Flaky {
                        fail_times: 2,
                        calls: Arc::clone(&calls),
                    },
                )
                .retry_policy(ExponentialBackoff {
                    max_attempts: 3,
                    backoff_ms: 5,
                    ..Default::default()
                }),
        );
        let (outcome, _ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.output("end"), Some(&json!({"call": 3})));
    }

    #[tokio::test]
    async fn panicking_retry_policy_fails_the_node() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![make_graph_linear("flaky")],
            Orchestrator::builder()
                .handler(
                    "flaky",
                    Flaky {
                        fail_times: u32::MAX,
                        calls: Arc::clone(&calls),
                    },
                )
                .retry_policy(PanickingPolicy),
        );
        let (outcome, ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.node_state("work"), Some(NodeState::Failed));
        assert_eq!(ctx.node_state("end"), Some(NodeState::Skipped));
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].cause.contains("policy exploded"));
        assert_eq!(outcome.failures[0].severity, Severity::Fatal);
    }

    #[tokio::test]
    async fn transient_failure_without_policy_is_final() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![make_graph_linear("flaky")],
            Orchestrator::builder().handler(
                "flaky",
                Flaky {
                    fail_times: 1,
                    calls: Arc::clone(&calls),
                },
            ),
        );
        let (outcome, _ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failures[0].severity, Severity::Transient);
    }

    #[tokio::test]
    async fn unknown_handler_is_rejected_before_running() {
        let orch = make_orchestrator(vec![make_graph_linear("nobody")], Orchestrator::builder());
        let err = orch.run("linear", json!(null)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UnknownHandler { ref handler, .. } if handler == "nobody"
        ));
    }

    #[tokio::test]
    async fn missing_sub_graph_is_rejected() {
        let orch = make_orchestrator(
            vec![make_graph_map(MapSpec::new("absent"))],
            Orchestrator::builder(),
        );
        let err = orch.run("mapper", json!([1])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::GraphNotFound { ref graph_id } if graph_id == "absent"));
    }

    // -- Suspension ---------------------------------------------------------

    #[tokio::test]
    async fn suspended_node_is_polled_until_it_succeeds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![make_graph_linear("poller")],
            Orchestrator::builder().handler(
                "poller",
                Poller {
                    polls: 2,
                    retry_after: Duration::from_millis(10),
                    log: Arc::clone(&log),
                },
            ),
        );
        let (outcome, ctx) = orch.run("linear", json!("job")).await.unwrap();
        assert!(outcome.is_completed());
        let attempts: Vec<u32> = log.lock().iter().map(|(_, a)| *a).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert!(ctx.ledger().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_without_calling_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![make_graph_linear("stuck")],
            Orchestrator::builder().handler(
                "stuck",
                Stuck {
                    suspension: Suspension::new("t", Duration::from_millis(5)).max_retries(3),
                    calls: Arc::clone(&calls),
                },
            ),
        );
        let (outcome, _ctx) = orch.run("linear", json!(null)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.failures[0].origin, FailureOrigin::SuspensionTimeout);
    }

    #[tokio::test]
    async fn deadline_fires_before_a_later_poll() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![make_graph_linear("stuck")],
            Orchestrator::builder().handler(
                "stuck",
                Stuck {
                    suspension: Suspension::new("t", Duration::from_secs(30))
                        .max_wait_time(Duration::from_millis(80)),
                    calls: Arc::clone(&calls),
                },
            ),
        );
        let started = Instant::now();
        let run = orch.run("linear", json!(null));
        let (outcome, ctx) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("deadline should end the run long before the next poll")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failures[0].origin, FailureOrigin::SuspensionTimeout);
        assert!(outcome.failures[0].cause.contains("deadline"));
        assert!(ctx.ledger().is_empty());
    }

    #[tokio::test]
    async fn each_suspension_polls_once_at_its_own_time() {
        struct Timed(Arc<Mutex<Vec<(String, u32, Instant)>>>);

        #[async_trait]
        impl NodeHandler for Timed {
            async fn execute(
                &self,
                ctx: &NodeCtx,
                _inputs: NodeInputs,
                _cancel: CancellationToken,
            ) -> NodeExecutionResult {
                self.0
                    .lock()
                    .push((ctx.node_id().to_string(), ctx.poll_attempt(), Instant::now()));
                if ctx.poll_attempt() == 0 {
                    let wait = ctx.config()["retry_ms"].as_u64().unwrap_or(0);
                    return Suspension::new("t", Duration::from_millis(wait)).into();
                }
                NodeExecutionResult::value(json!(ctx.node_id()))
            }
        }

        let mut builder = GraphBuilder::new("waits")
            .node(NodeDef::start("start"))
            .node(NodeDef::end("end"));
        for (id, ms) in [("a", 40), ("b", 80), ("c", 120)] {
            builder = builder
                .node(NodeDef::handler(id, "timed").with_config(json!({"retry_ms": ms})))
                .connect("start", 0, id)
                .connect(id, 0, "end");
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![builder.build().unwrap()],
            Orchestrator::builder().handler("timed", Timed(Arc::clone(&log))),
        );
        let (outcome, _ctx) = orch.run("waits", json!(null)).await.unwrap();
        assert!(outcome.is_completed());

        let log = log.lock();
        assert_eq!(log.len(), 6);
        for (id, ms) in [("a", 40u64), ("b", 80), ("c", 120)] {
            let calls: Vec<&(String, u32, Instant)> = log.iter().filter(|(n, _, _)| n == id).collect();
            assert_eq!(calls.len(), 2);
            assert!(calls[1].2 - calls[0].2 >= Duration::from_millis(ms));
        }
    }

    // -- Map ----------------------------------------------------------------

    #[tokio::test]
    async fn map_items_poll_to_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![
                make_graph_item("poller"),
                make_graph_map(MapSpec::new("item").max_parallel_tasks(2)),
            ],
            Orchestrator::builder().handler(
                "poller",
                Poller {
                    polls: 2,
                    retry_after: Duration::from_millis(10),
                    log: Arc::clone(&log),
                },
            ),
        );
        let (outcome, _ctx) = orch.run("mapper", json!(["a", "b", "c"])).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(
            results(&outcome),
            vec![
                json!({"item": "a", "polls": 2}),
                json!({"item": "b", "polls": 2}),
                json!({"item": "c", "polls": 2}),
            ]
        );
        assert_eq!(log.lock().len(), 9);
    }

    #[tokio::test]
    async fn suspended_item_releases_its_slot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![
                make_graph_item("poller"),
                make_graph_map(MapSpec::new("item").max_parallel_tasks(1)),
            ],
            Orchestrator::builder().handler(
                "poller",
                Poller {
                    polls: 1,
                    retry_after: Duration::from_millis(100),
                    log: Arc::clone(&log),
                },
            ),
        );
        let (outcome, _ctx) = orch.run("mapper", json!(["a", "b", "c"])).await.unwrap();
        assert!(outcome.is_completed());

        // With one slot, every item still gets its first call before any
        // item is polled again.
        let log = log.lock();
        assert_eq!(log.len(), 6);
        assert!(log[..3].iter().all(|(_, attempt)| *attempt == 0));
    }

    #[tokio::test]
    async fn deadline_exhaustion_pads_with_nulls() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![
                make_graph_item("stuck"),
                make_graph_map(
                    MapSpec::new("item")
                        .max_parallel_tasks(3)
                        .error_mode(ErrorMode::ContinueWithNulls),
                ),
            ],
            Orchestrator::builder().handler(
                "stuck",
                Stuck {
                    suspension: Suspension::new("t", Duration::from_millis(50))
                        .max_wait_time(Duration::from_millis(200)),
                    calls: Arc::clone(&calls),
                },
            ),
        );
        let (outcome, ctx) = orch.run("mapper", json!([1, 2, 3])).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(results(&outcome), vec![Value::Null, Value::Null, Value::Null]);
        assert_eq!(ctx.node_state("fan"), Some(NodeState::Completed));
        assert_eq!(outcome.failures.len(), 3);
        assert!(outcome.failures.iter().all(|f| f.contained));
    }

    #[tokio::test]
    async fn retry_exhaustion_with_omit_yields_empty_list() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = make_orchestrator(
            vec![
                make_graph_item("stuck"),
                make_graph_map(
                    MapSpec::new("item").error_mode(ErrorMode::ContinueOmitFailures),
                ),
            ],
            Orchestrator::builder().handler(
                "stuck",
                Stuck {
                    suspension: Suspension::new("t", Duration::from_millis(10)).max_retries(2),
                    calls: Arc::clone(&calls),
                },
            ),
        );
        let (outcome, _ctx) = orch.run("mapper", json!(["x", "y", "z"])).await.unwrap();
        assert!(outcome.is_completed());
        assert!(results(&outcome).is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn middle_item_timeout_keeps_positions() {
        let orch = make_orchestrator(
            vec![
                make_graph_item("picky"),
                make_graph_map(
                    MapSpec::new("item")
                        .max_parallel_tasks(3)
                        .error_mode(ErrorMode::ContinueWithNulls),
                ),
            ],
            Orchestrator::builder().handler("picky", Picky),
        );
        let (outcome, _ctx) = orch.run("mapper", json!(["a", "slow", "c"])).await.unwrap();
        assert_eq!(
            results(&outcome),
            vec![json!({"value": "a"}), Value::Null, json!({"value": "c"})]
        );
        assert_eq!(outcome.failures[0].item_index, Some(1));
    }

    #[tokio::test]
    async fn omit_drops_failures_in_order() {
        let orch = make_orchestrator(
            vec![
                make_graph_item("picky"),
                make_graph_map(
                    MapSpec::new("item").error_mode(ErrorMode::ContinueOmitFailures),
                ),
            ],
            Orchestrator::builder().handler("picky", Picky),
        );
        let (outcome, _ctx) = orch
            .run("mapper", json!(["a", "bad", "c", "bad", "e"]))
            .await
            .unwrap();
        assert_eq!(
            results(&outcome),
            vec![json!({"value": "a"}), json!({"value": "c"}), json!({"value": "e"})]
        );
    }

    #[tokio::test]
    async fn halt_on_failure_fails_the_map() {
        let orch = make_orchestrator(
            vec![
                make_graph_item("picky"),
                make_graph_map(MapSpec::new("item").max_parallel_tasks(1)),
            ],
            Orchestrator::builder().handler("picky", Picky),
        );
        let (outcome, ctx) = orch.run("mapper", json!(["a", "bad", "c"])).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(ctx.node_state("fan"), Some(NodeState::Failed));
        assert_eq!(ctx.node_state("end"), Some(NodeState::Skipped));

        let failure = outcome
            .failures
            .iter()
            .find(|f| f.node_id == "fan")
            .unwrap();
        assert_eq!(failure.item_index, Some(1));
        assert_eq!(failure.origin, FailureOrigin::MapItem);
        assert!(!failure.contained);
        assert!(ctx.ledger().is_empty());
    }

    #[tokio::test]
    async fn map_reads_items_field_and_handles_empty_and_non_lists() {
        let orch = make_orchestrator(
            vec![
                make_graph_item("passthrough"),
                make_graph_map(MapSpec::new("item").items_field("files")),
            ],
            Orchestrator::builder().builtin_nodes(),
        );
        let (outcome, _ctx) = orch
            .run("mapper", json!({"files": [{"n": 1}, {"n": 2}]}))
            .await
            .unwrap();
        assert_eq!(results(&outcome), vec![json!({"n": 1}), json!({"n": 2})]);

        let (outcome, _ctx) = orch.run("mapper", json!({"files": []})).await.unwrap();
        assert!(outcome.is_completed());
        assert!(results(&outcome).is_empty());

        let (outcome, ctx) = orch.run("mapper", json!({"files": "nope"})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(ctx.node_state("fan"), Some(NodeState::Failed));
    }

    #[tokio::test]
    async fn map_items_carry_item_tag() {
        struct TagReader;

        #[async_trait]
        impl NodeHandler for TagReader {
            async fn execute(
                &self,
                ctx: &NodeCtx,
                _inputs: NodeInputs,
                _cancel: CancellationToken,
            ) -> NodeExecutionResult {
                NodeExecutionResult::value(json!({
                    "tag": ctx.tags().get("lib:map_item"),
                    "index": ctx.item_index(),
                    "parent": ctx.tags().get("app:tenant"),
                }))
            }
        }

        let orch = make_orchestrator(
            vec![make_graph_item("reader"), make_graph_map(MapSpec::new("item"))],
            Orchestrator::builder().handler("reader", TagReader),
        );
        let ctx = ExecutionContext::new(orch.graphs().get("mapper").unwrap(), json!([0, 1]));
        ctx.tags().add("app:tenant", "acme");
        let outcome = orch.execute(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            results(&outcome),
            vec![
                json!({"tag": "fan[0]", "index": 0, "parent": "acme"}),
                json!({"tag": "fan[1]", "index": 1, "parent": "acme"}),
            ]
        );
        assert!(ctx.tags().get("lib:map_item").is_none());
    }

    // -- Cancellation and resume --------------------------------------------

    #[tokio::test]
    async fn cancellation_leaves_nodes_in_flight() {
        let orch = make_orchestrator(
            vec![make_graph_linear("sleep")],
            Orchestrator::builder().handler("sleep", Sleeper(Duration::from_secs(10))),
        );
        let ctx = ExecutionContext::new(orch.graphs().get("linear").unwrap(), json!(null));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = orch.execute(&ctx, &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(ctx.node_state("start"), Some(NodeState::Completed));
        assert_eq!(ctx.node_state("work"), Some(NodeState::Running));
        assert_eq!(ctx.node_state("end"), Some(NodeState::NotStarted));
    }

    #[tokio::test]
    async fn cancelled_run_resumes_from_snapshot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![make_graph_linear("poller")],
            Orchestrator::builder().handler(
                "poller",
                Poller {
                    polls: 1,
                    retry_after: Duration::from_millis(150),
                    log: Arc::clone(&log),
                },
            ),
        );
        let ctx = ExecutionContext::new(orch.graphs().get("linear").unwrap(), json!("job"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            trigger.cancel();
        });
        assert!(orch.execute(&ctx, &cancel).await.is_err());
        assert_eq!(ctx.node_state("work"), Some(NodeState::Suspended));

        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        let snapshot: ExecutionSnapshot = serde_json::from_str(&json).unwrap();
        let restored = orch.restore(snapshot).unwrap();
        assert_eq!(restored.run_id(), ctx.run_id());

        let outcome = orch
            .execute(&restored, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.output("end"),
            Some(&json!({"item": "job", "polls": 1}))
        );
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn parked_map_items_survive_restore() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orch = make_orchestrator(
            vec![
                make_graph_item("poller"),
                make_graph_map(MapSpec::new("item").max_parallel_tasks(3)),
            ],
            Orchestrator::builder().handler(
                "poller",
                Poller {
                    polls: 1,
                    retry_after: Duration::from_millis(150),
                    log: Arc::clone(&log),
                },
            ),
        );
        let ctx = ExecutionContext::new(orch.graphs().get("mapper").unwrap(), json!([1, 2, 3]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert!(orch.execute(&ctx, &cancel).await.is_err());
        assert_eq!(ctx.node_state("fan"), Some(NodeState::Running));
        assert_eq!(ctx.ledger().len(), 3);

        let restored = orch.restore(ctx.snapshot()).unwrap();
        let outcome = orch
            .execute(&restored, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(results(&outcome).len(), 3);
        // Three first calls before the cancel, three polls after restore.
        assert_eq!(log.lock().len(), 6);
    }

    #[tokio::test]
    async fn map_over_huge_parallelism_is_rejected_at_registration() {
        let registry = GraphRegistry::new();
        let err = registry
            .register(
                "mapper",
                make_graph_map(MapSpec::new("item").max_parallel_tasks(usize::MAX)),
            )
            .unwrap_err();
        assert!(err.to_string().contains("max_parallel_tasks"));
        assert!(registry.get("mapper").is_none());
    }

    #[tokio::test]
    async fn map_can_recurse_into_its_own_graph() {
        let tree = GraphBuilder::new("tree")
            .node(NodeDef::start("start"))
            .node(NodeDef::map("fan", MapSpec::new("tree").items_field("children")))
            .node(NodeDef::end("end"))
            .connect("start", 0, "fan")
            .connect("fan", 0, "end")
            .build()
            .unwrap();
        let orch = make_orchestrator(vec![tree], Orchestrator::builder());

        let input = json!({"children": [{"children": []}, {"children": [{"children": []}]}]});
        let (outcome, _ctx) = orch.run("tree", input).await.unwrap();
        assert!(outcome.is_completed(), "{:?}", outcome.failures);
        assert_eq!(
            outcome.output("end"),
            Some(&json!({"results": [
                {"results": []},
                {"results": [{"results": []}]},
            ]}))
        );
    }

    #[tokio::test]
    async fn finished_context_executes_as_noop() {
        let orch = make_orchestrator(
            vec![make_graph_linear("passthrough")],
            Orchestrator::builder().builtin_nodes(),
        );
        let (first, ctx) = orch.run("linear", json!({"k": 1})).await.unwrap();
        let second = orch.execute(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(first.node_states, second.node_states);
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.correlation_tag, "lib:correlation_id");
        assert_eq!(config.map_item_tag, "lib:map_item");
    }
}
