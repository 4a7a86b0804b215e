//! Phase routing: which phase owns a claimed item, and whether it may run.
//!
//! Selection is first-match-wins: an already pinned phase id, then each
//! phase's url filter (marker membership, exact depth, regex patterns), and
//! finally the workflow's first phase for start URLs. Extraction phases are
//! additionally gated on discovery completeness; a gated item is requeued,
//! never failed, and the check runs before any browser session is acquired.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::config::{PhaseType, UrlFilter, WorkflowConfig, WorkflowPhase};
use crate::error::{CrawlError, Result};
use crate::model::UrlQueueItem;
use crate::queue::UrlQueue;

/// A phase plus its pre-compiled url-filter patterns. Patterns were already
/// syntax-checked by config validation.
pub struct CompiledPhase {
    pub phase: WorkflowPhase,
    patterns: Vec<Regex>,
}

impl CompiledPhase {
    fn new(phase: WorkflowPhase) -> Result<Self> {
        let patterns = match &phase.url_filter {
            Some(filter) => filter
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        CrawlError::InvalidConfig(format!("invalid pattern '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self { phase, patterns })
    }

    fn filter_matches(&self, item: &UrlQueueItem) -> bool {
        let Some(filter) = &self.phase.url_filter else {
            return false;
        };
        if marker_matches(filter, item) {
            return true;
        }
        if filter.depth == Some(item.depth) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(&item.url))
    }
}

fn marker_matches(filter: &UrlFilter, item: &UrlQueueItem) -> bool {
    match &item.marker {
        Some(marker) => filter.markers.iter().any(|m| m == marker),
        None => false,
    }
}

#[derive(Clone)]
pub enum RouteDecision {
    Run(Arc<CompiledPhase>),
    Requeue,
}

pub struct PhaseRouter {
    phases: Vec<Arc<CompiledPhase>>,
}

impl PhaseRouter {
    pub fn new(config: &WorkflowConfig) -> Result<Self> {
        let phases = config
            .phases
            .iter()
            .map(|p| CompiledPhase::new(p.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { phases })
    }

    /// Phase selection only; no completeness check.
    pub fn select(&self, item: &UrlQueueItem) -> Result<Arc<CompiledPhase>> {
        if let Some(phase_id) = &item.phase_id {
            return self
                .phases
                .iter()
                .find(|p| &p.phase.id == phase_id)
                .cloned()
                .ok_or_else(|| CrawlError::NoMatchingPhase(item.url.clone()));
        }
        if let Some(matched) = self.phases.iter().find(|p| p.filter_matches(item)) {
            return Ok(matched.clone());
        }
        if item.is_start_url() {
            if let Some(first) = self.phases.first() {
                return Ok(first.clone());
            }
        }
        Err(CrawlError::NoMatchingPhase(item.url.clone()))
    }

    /// True when the item routes to a discovery phase. Items that route
    /// nowhere are not discovery work.
    pub fn is_discovery_item(&self, item: &UrlQueueItem) -> bool {
        self.select(item)
            .map(|p| p.phase.phase_type == PhaseType::Discovery)
            .unwrap_or(false)
    }

    /// Full routing decision for a claimed item. Extraction may only run once
    /// no other active item of the execution still routes to a discovery
    /// phase; otherwise the decision is `Requeue`.
    pub async fn decide(&self, item: &UrlQueueItem, queue: &dyn UrlQueue) -> Result<RouteDecision> {
        let phase = self.select(item)?;
        if phase.phase.phase_type == PhaseType::Extraction {
            let discovery_pending = queue
                .has_pending_discovery_urls(&item.execution_id, Some(&item.id), &|candidate| {
                    self.is_discovery_item(candidate)
                })
                .await?;
            if discovery_pending {
                debug!(url = %item.url, "discovery incomplete, requeueing extraction item");
                return Ok(RouteDecision::Requeue);
            }
        }
        Ok(RouteDecision::Run(phase))
    }
}
