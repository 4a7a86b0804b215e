//! crawlflow - a declarative, phase-based web crawling orchestrator.
//!
//! Operators describe a crawl as a set of phases, each phase a DAG of nodes
//! (navigate, extract, click, paginate, discover-links) run against a live
//! browser session. The crate owns the scheduling core: the persistent URL
//! queue with hierarchy and phase-membership tracking, the per-phase DAG
//! scheduler, the phase router that keeps extraction behind discovery, and
//! the node-dispatch loop. Browser sessions, the extraction pipeline and
//! durable repositories are external collaborators behind traits.

pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod model;
pub mod nodes;
pub mod queue;
pub mod registry;
pub mod repo;
pub mod router;
pub mod session;

pub use config::{
    NodeSpec, PhaseTransition, PhaseType, RetryPolicy, UrlFilter, WorkflowConfig, WorkflowPhase,
};
pub use context::ExecutionContext;
pub use dag::NodeGraph;
pub use error::{CrawlError, Result};
pub use executor::{CrawlExecutor, CrawlReport};
pub use model::{
    ExecutionRecord, ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, NodeRunStatus,
    Outcome, UrlId, UrlQueueItem, UrlStatus,
};
pub use queue::{SledUrlQueue, UrlQueue};
pub use registry::{
    DiscoveredUrl, ExecutorLoader, NodeExecutor, NodeInput, NodeOutput, NodeRegistry,
};
pub use repo::{
    ExecutionRepo, ExtractedItemsRepo, MemoryExecutionRepo, MemoryExtractedItemsRepo,
    MemoryNodeExecutionRepo, NodeExecutionRepo,
};
pub use router::{PhaseRouter, RouteDecision};
pub use session::{
    BrowserPool, BrowserSession, ErrorRecovery, ExtractConfig, Extractor, PageResponse,
    Remediation, SelectorExtractor,
};
