//! Data model for the crawl frontier and the persisted audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type UrlId = String;

/// Status of one frontier entry. Transitions only move forward along
/// pending -> processing -> {completed | failed | requeued}; a requeued item
/// re-enters the claimable set without penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Requeued,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Completed => "completed",
            UrlStatus::Failed => "failed",
            UrlStatus::Requeued => "requeued",
        }
    }

    /// True while the item still counts toward the run's unfinished work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UrlStatus::Pending | UrlStatus::Processing | UrlStatus::Requeued
        )
    }

    /// True when a dequeue call may claim the item.
    pub fn is_claimable(&self) -> bool {
        matches!(self, UrlStatus::Pending | UrlStatus::Requeued)
    }
}

/// One entry of the crawl frontier. Items are never deleted during a run;
/// completed and failed entries are retained for hierarchy and analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlQueueItem {
    pub id: UrlId,
    pub execution_id: String,
    pub url: String,
    pub depth: u32,
    /// Higher priority dequeues first.
    pub priority: i32,
    pub status: UrlStatus,
    /// Incremented only on retryable failure, never on requeue.
    pub retry_count: u32,
    /// Weak back-reference to the item that discovered this one.
    pub parent_url_id: Option<UrlId>,
    pub discovered_by_node: Option<String>,
    /// Free-text tag set by the discovering node, used for phase routing.
    pub marker: Option<String>,
    /// Once routed, pins the item to a phase.
    pub phase_id: Option<String>,
    pub error: Option<String>,
    /// Insertion sequence, assigned by the queue; FIFO tie-break.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UrlQueueItem {
    /// A start URL at depth 0 with no parent.
    pub fn seed(execution_id: impl Into<String>, url: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: cuid2::create_id(),
            execution_id: execution_id.into(),
            url: url.into(),
            depth: 0,
            priority,
            status: UrlStatus::Pending,
            retry_count: 0,
            parent_url_id: None,
            discovered_by_node: None,
            marker: None,
            phase_id: None,
            error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A URL discovered while processing `parent`. Depth and the parent
    /// back-reference are derived here so the hierarchy invariant
    /// (`depth = parent.depth + 1`) cannot be violated by callers.
    pub fn child(
        parent: &UrlQueueItem,
        url: impl Into<String>,
        discovered_by_node: impl Into<String>,
        marker: Option<String>,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: cuid2::create_id(),
            execution_id: parent.execution_id.clone(),
            url: url.into(),
            depth: parent.depth + 1,
            priority,
            status: UrlStatus::Pending,
            retry_count: 0,
            parent_url_id: Some(parent.id.clone()),
            discovered_by_node: Some(discovered_by_node.into()),
            marker,
            phase_id: None,
            error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_start_url(&self) -> bool {
        self.parent_url_id.is_none() && self.depth == 0
    }
}

/// Per-item processing outcome. A tagged result rather than a sentinel error:
/// callers branch on data, and `Requeued` is never reported as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
}

/// Persisted audit record for one node run. Created `Running` before
/// dispatch, updated on completion or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub url_id: UrlId,
    pub status: NodeRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub urls_discovered: u32,
    pub items_extracted: u32,
}

impl NodeExecution {
    pub fn start(
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        url_id: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self {
            id: cuid2::create_id(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            url_id: url_id.into(),
            status: NodeRunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            input,
            output: None,
            error: None,
            retry_count: 0,
            urls_discovered: 0,
            items_extracted: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Aggregate counters for one run, flushed periodically and at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub processed: u64,
    pub failed: u64,
    pub discovered: u64,
    pub extracted: u64,
}

/// Run-level record owned by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub stats: ExecutionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: cuid2::create_id(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            stats: ExecutionStats::default(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// One extracted record, tied to the item it came from and the audit id of
/// the node run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub id: String,
    pub execution_id: String,
    pub url_id: UrlId,
    pub node_execution_id: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ExtractedItem {
    pub fn new(
        execution_id: impl Into<String>,
        url_id: impl Into<String>,
        node_execution_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            id: cuid2::create_id(),
            execution_id: execution_id.into(),
            url_id: url_id.into(),
            node_execution_id,
            data,
            created_at: Utc::now(),
        }
    }
}
