//! Registries for named graph definitions and node handlers.
//!
//! The [`GraphRegistry`] stores validated [`GraphDef`]s keyed by id so Map
//! nodes can reference their sub-graph by id. The [`HandlerRegistry`] maps
//! handler names to factories.
//!
//! Both are thread-safe and cheaply cloneable. All clones share the same
//! underlying storage via `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::BuildError;
use crate::traits::NodeHandler;
use crate::types::GraphDef;
use crate::validate::validate_graph;

// ---------------------------------------------------------------------------
// GraphRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of validated graph definitions.
///
/// Stored graphs are immutable `Arc`s. Re-registering an id swaps the entry;
/// runs that already hold the old graph keep using it.
#[derive(Clone, Default)]
pub struct GraphRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<GraphDef>>>>,
}

impl GraphRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a graph under `id`.
    pub fn register(&self, id: impl Into<String>, graph: GraphDef) -> Result<(), BuildError> {
        validate_graph(&graph).map_err(|errors| BuildError::from_list(&graph.id, errors))?;
        let id = id.into();
        tracing::debug!(graph_id = %id, nodes = graph.nodes.len(), "graph registered");
        self.inner.write().insert(id, Arc::new(graph));
        Ok(())
    }

    /// Look up a graph by id.
    pub fn get(&self, id: &str) -> Option<Arc<GraphDef>> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Returns the number of registered graphs.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns `true` if no graphs are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl std::fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.read();
        f.debug_struct("GraphRegistry")
            .field("count", &guard.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Builds a handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn NodeHandler> + Send + Sync>;

/// Name to factory map for [`NodeHandler`]s.
///
/// Factories run once per handler name per run; the resulting instance is
/// shared by every node and Map item of that run that names it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared handler instance.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.register_factory(name, move || Arc::clone(&handler));
    }

    /// Register a factory that builds a fresh handler for each run.
    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn NodeHandler> + Send + Sync + 'static,
    {
        self.inner.write().insert(name.into(), Arc::new(factory));
    }

    /// Instantiate the handler registered under `name`.
    pub fn create(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
        let factory = self.inner.read().get(name).cloned()?;
        Some(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}
