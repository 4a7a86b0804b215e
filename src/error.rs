//! Error taxonomy for the crawl orchestrator.
//!
//! Node executors and collaborators report through `CrawlError`; the executor
//! translates node-level failures into audit records and decides per-item
//! outcomes, so only config- and queue-level errors ever abort a whole run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid workflow config: {0}")]
    InvalidConfig(String),

    #[error("unknown node '{0}' referenced as a dependency")]
    UnknownNode(String),

    #[error("dependency cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("node type '{0}' is already registered")]
    DuplicateType(String),

    #[error("no executor registered for node type '{0}'")]
    ExecutorNotFound(String),

    #[error("invalid queue item: {0}")]
    InvalidItem(String),

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    #[error("item {item_id} is {status}, expected {expected}")]
    InvalidTransition {
        item_id: String,
        status: String,
        expected: String,
    },

    #[error("no phase matches url '{0}'")]
    NoMatchingPhase(String),

    #[error("node '{node_id}' params invalid: {message}")]
    NodeValidation { node_id: String, message: String },

    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("browser session: {0}")]
    Session(String),

    #[error("navigation to '{url}' failed: {message}")]
    Navigation { url: String, message: String },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl CrawlError {
    pub fn node_execution(node_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    pub fn node_validation(node_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::NodeValidation {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
