//! Persistence collaborator interfaces and in-memory defaults.
//!
//! The executor treats these as durable side-effect sinks: a failed write is
//! logged and never blocks the crawl. The DashMap-backed implementations
//! below serve tests and single-process runs; durable backends implement the
//! same traits.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{CrawlError, Result};
use crate::model::{
    ExecutionRecord, ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, NodeRunStatus,
};

#[async_trait]
pub trait NodeExecutionRepo: Send + Sync {
    async fn create(&self, record: NodeExecution) -> Result<()>;
    async fn update(&self, record: NodeExecution) -> Result<()>;
    async fn mark_completed(&self, id: &str, output: Option<Value>, discovered: u32, extracted: u32) -> Result<()>;
    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Option<NodeExecution>>;
}

#[async_trait]
pub trait ExtractedItemsRepo: Send + Sync {
    async fn create(&self, item: ExtractedItem) -> Result<()>;
    async fn create_batch(&self, items: Vec<ExtractedItem>) -> Result<()>;
    async fn get_count(&self, execution_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn create(&self, record: ExecutionRecord) -> Result<()>;
    async fn update_status(&self, id: &str, status: ExecutionStatus, error: Option<String>) -> Result<()>;
    async fn update_stats(&self, id: &str, stats: ExecutionStats) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Option<ExecutionRecord>>;
}

#[derive(Default)]
pub struct MemoryNodeExecutionRepo {
    records: DashMap<String, NodeExecution>,
}

impl MemoryNodeExecutionRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<NodeExecution> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl NodeExecutionRepo for MemoryNodeExecutionRepo {
    async fn create(&self, record: NodeExecution) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, record: NodeExecution) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn mark_completed(&self, id: &str, output: Option<Value>, discovered: u32, extracted: u32) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CrawlError::Persistence(format!("node execution {} not found", id)))?;
        record.status = NodeRunStatus::Completed;
        record.finished_at = Some(chrono::Utc::now());
        record.output = output;
        record.urls_discovered = discovered;
        record.items_extracted = extracted;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CrawlError::Persistence(format!("node execution {} not found", id)))?;
        record.status = NodeRunStatus::Failed;
        record.finished_at = Some(chrono::Utc::now());
        record.error = Some(error.to_string());
        record.retry_count = retry_count;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}

#[derive(Default)]
pub struct MemoryExtractedItemsRepo {
    items: DashMap<String, ExtractedItem>,
}

impl MemoryExtractedItemsRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<ExtractedItem> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl ExtractedItemsRepo for MemoryExtractedItemsRepo {
    async fn create(&self, item: ExtractedItem) -> Result<()> {
        self.items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn create_batch(&self, items: Vec<ExtractedItem>) -> Result<()> {
        for item in items {
            self.items.insert(item.id.clone(), item);
        }
        Ok(())
    }

    async fn get_count(&self, execution_id: &str) -> Result<u64> {
        Ok(self
            .items
            .iter()
            .filter(|e| e.value().execution_id == execution_id)
            .count() as u64)
    }
}

#[derive(Default)]
pub struct MemoryExecutionRepo {
    records: DashMap<String, ExecutionRecord>,
}

impl MemoryExecutionRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ExecutionRepo for MemoryExecutionRepo {
    async fn create(&self, record: ExecutionRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_status(&self, id: &str, status: ExecutionStatus, error: Option<String>) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CrawlError::Persistence(format!("execution {} not found", id)))?;
        record.status = status;
        record.error = error;
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_stats(&self, id: &str, stats: ExecutionStats) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CrawlError::Persistence(format!("execution {} not found", id)))?;
        record.stats = stats;
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}
