//! Node executor registry.
//!
//! Maps a node-type tag to a polymorphic executor. Compiled-in executors and
//! ones brought in through an `ExecutorLoader` are indistinguishable once
//! registered; the registry is an explicit object constructed per run and
//! passed by reference, never ambient global state.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use crate::context::ExecutionContext;
use crate::error::{CrawlError, Result};
use crate::model::UrlQueueItem;
use crate::session::BrowserSession;

/// A URL reported by a node, before resolution against the page base.
#[derive(Debug, Clone)]
pub struct DiscoveredUrl {
    pub url: String,
    /// Marker copied onto the enqueued child, used for phase routing.
    pub marker: Option<String>,
    pub priority: i32,
}

/// Everything a node sees for one dispatch.
pub struct NodeInput {
    pub node_id: String,
    pub params: Value,
    pub item: UrlQueueItem,
    pub session: Arc<dyn BrowserSession>,
    pub ctx: ExecutionContext,
}

/// Result of one node dispatch: an optional value for the execution context
/// plus any newly discovered URLs.
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub value: Option<Value>,
    pub discovered: Vec<DiscoveredUrl>,
}

impl NodeOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            discovered: Vec::new(),
        }
    }

    pub fn discovered(discovered: Vec<DiscoveredUrl>) -> Self {
        Self {
            value: None,
            discovered,
        }
    }
}

/// Capability set of a node executor. `validate` runs once per workflow load
/// against the node's configured params; `execute` runs per dispatch.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Type tag this executor is registered under.
    fn node_type(&self) -> &str;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput>;
}

/// Loader seam for externally provided executors (plugins). File discovery,
/// symbol resolution and versioning live behind this trait; the registry
/// calls it exactly once at registration time, never during dispatch.
pub trait ExecutorLoader: Send + Sync {
    fn load(&self) -> Result<Vec<Arc<dyn NodeExecutor>>>;
}

#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: Arc<DashMap<String, Arc<dyn NodeExecutor>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            executors: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, executor: Arc<dyn NodeExecutor>) -> Result<()> {
        let tag = executor.node_type().to_string();
        match self.executors.entry(tag.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CrawlError::DuplicateType(tag)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(node_type = %tag, "registered node executor");
                slot.insert(executor);
                Ok(())
            }
        }
    }

    /// Register every executor a loader provides.
    pub fn register_loaded(&self, loader: &dyn ExecutorLoader) -> Result<usize> {
        let executors = loader.load()?;
        let count = executors.len();
        for executor in executors {
            self.register(executor)?;
        }
        info!(count, "registered loaded node executors");
        Ok(count)
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.executors
            .get(node_type)
            .map(|e| e.value().clone())
            .ok_or_else(|| CrawlError::ExecutorNotFound(node_type.to_string()))
    }

    pub fn is_registered(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    pub fn list(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }
}
