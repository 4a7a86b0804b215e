//! The orchestration loop.
//!
//! Workers pull from the shared URL queue, route each claimed item to its
//! phase, run the phase's node DAG in topological order on one browser
//! session, propagate discovered URLs back into the frontier, and settle the
//! item as completed, failed or requeued. The queue claim is the only shared
//! mutation point; everything else a worker touches is per-item.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{PhaseType, WorkflowConfig};
use crate::context::ExecutionContext;
use crate::error::{CrawlError, Result};
use crate::model::{
    ExecutionRecord, ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, Outcome,
    UrlQueueItem,
};
use crate::queue::UrlQueue;
use crate::registry::{NodeInput, NodeRegistry};
use crate::repo::{
    ExecutionRepo, ExtractedItemsRepo, MemoryExecutionRepo, MemoryExtractedItemsRepo,
    MemoryNodeExecutionRepo, NodeExecutionRepo,
};
use crate::router::{CompiledPhase, PhaseRouter, RouteDecision};
use crate::session::{BrowserPool, BrowserSession, ErrorRecovery, Remediation};

const SEED_PRIORITY: i32 = 100;

/// Run-level summary handed back to CLI/API callers. `requeued` is always
/// reconciled before a run reports done, so the stats never show partial
/// states.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub stats: ExecutionStats,
}

#[derive(Default)]
struct SharedStats {
    processed: AtomicU64,
    failed: AtomicU64,
    discovered: AtomicU64,
    extracted: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discovered: self.discovered.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct CrawlExecutor {
    config: Arc<WorkflowConfig>,
    registry: NodeRegistry,
    router: Arc<PhaseRouter>,
    queue: Arc<dyn UrlQueue>,
    pool: Arc<dyn BrowserPool>,
    node_runs: Arc<dyn NodeExecutionRepo>,
    extracted: Arc<dyn ExtractedItemsRepo>,
    executions: Arc<dyn ExecutionRepo>,
    recovery: Option<Arc<dyn ErrorRecovery>>,
    workers: usize,
    poll_interval: Duration,
    stats_flush_interval: Duration,
}

impl CrawlExecutor {
    /// Validates the workflow against the registry up front: every node type
    /// must be registered and every node's params must decode. Config-level
    /// problems abort here, before anything runs.
    pub fn new(
        config: WorkflowConfig,
        registry: NodeRegistry,
        queue: Arc<dyn UrlQueue>,
        pool: Arc<dyn BrowserPool>,
    ) -> Result<Self> {
        config.validate()?;
        for phase in &config.phases {
            for node in &phase.nodes {
                let executor = registry.get(&node.node_type).map_err(|_| {
                    CrawlError::InvalidConfig(format!(
                        "phase '{}' node '{}' uses unregistered type '{}'",
                        phase.id, node.id, node.node_type
                    ))
                })?;
                executor.validate(&node.params).map_err(|e| {
                    CrawlError::InvalidConfig(format!(
                        "phase '{}' node '{}': {}",
                        phase.id, node.id, e
                    ))
                })?;
            }
        }
        let router = Arc::new(PhaseRouter::new(&config)?);
        Ok(Self {
            config: Arc::new(config),
            registry,
            router,
            queue,
            pool,
            node_runs: MemoryNodeExecutionRepo::new(),
            extracted: MemoryExtractedItemsRepo::new(),
            executions: MemoryExecutionRepo::new(),
            recovery: None,
            workers: 1,
            poll_interval: Duration::from_millis(100),
            stats_flush_interval: Duration::from_secs(5),
        })
    }

    pub fn with_repos(
        mut self,
        node_runs: Arc<dyn NodeExecutionRepo>,
        extracted: Arc<dyn ExtractedItemsRepo>,
        executions: Arc<dyn ExecutionRepo>,
    ) -> Self {
        self.node_runs = node_runs;
        self.extracted = extracted;
        self.executions = executions;
        self
    }

    pub fn with_error_recovery(mut self, recovery: Arc<dyn ErrorRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Worker count; effective concurrency is still bounded by the browser
    /// pool's session cap.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the workflow to completion or cancellation under a fresh
    /// execution.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<CrawlReport> {
        let record = ExecutionRecord::new(self.config.id.clone());
        let execution_id = record.id.clone();
        self.persist(self.executions.create(record).await, "execution create");
        self.run_inner(execution_id, cancel).await
    }

    /// Resume a prior execution: items stranded in `processing` by a crash
    /// or cancellation become claimable again, the existing frontier is
    /// kept, and seeds are only added where absent.
    pub async fn resume(
        &self,
        execution_id: impl Into<String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<CrawlReport> {
        let execution_id = execution_id.into();
        if !matches!(self.executions.get_by_id(&execution_id).await, Ok(Some(_))) {
            let mut record = ExecutionRecord::new(self.config.id.clone());
            record.id = execution_id.clone();
            self.persist(self.executions.create(record).await, "execution create");
        }
        self.run_inner(execution_id, cancel).await
    }

    async fn run_inner(
        &self,
        execution_id: String,
        cancel: watch::Receiver<bool>,
    ) -> Result<CrawlReport> {
        self.persist(
            self.executions
                .update_status(&execution_id, ExecutionStatus::Running, None)
                .await,
            "execution status",
        );

        // Anything stranded in `processing` by a previous run of this
        // execution becomes claimable again.
        self.queue.reset_stale_processing(&execution_id).await?;

        for url in &self.config.start_urls {
            self.queue
                .enqueue_if_new(UrlQueueItem::seed(&execution_id, url, SEED_PRIORITY))
                .await?;
        }
        info!(
            execution_id = %execution_id,
            workflow = %self.config.name,
            seeds = self.config.start_urls.len(),
            workers = self.workers,
            "crawl started"
        );

        let stats = Arc::new(SharedStats::default());
        let (done_tx, done_rx) = watch::channel(false);
        let flusher = self.spawn_stats_flusher(
            execution_id.clone(),
            stats.clone(),
            cancel.clone(),
            done_rx,
        );

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let this = self.clone();
            let execution_id = execution_id.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                this.worker_loop(&execution_id, &stats, cancel, worker).await
            }));
        }

        let mut worker_error: Option<CrawlError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "worker failed");
                    worker_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "worker panicked");
                    worker_error
                        .get_or_insert(CrawlError::Session(format!("worker join: {}", e)));
                }
            }
        }
        let _ = done_tx.send(true);
        let _ = flusher.await;

        let final_stats = stats.snapshot();
        self.persist(
            self.executions
                .update_stats(&execution_id, final_stats)
                .await,
            "final stats",
        );

        let cancelled = *cancel.borrow();
        let (status, error) = match (&worker_error, cancelled) {
            (Some(e), _) => (ExecutionStatus::Failed, Some(e.to_string())),
            (None, true) => (ExecutionStatus::Cancelled, None),
            (None, false) => (ExecutionStatus::Completed, None),
        };
        self.persist(
            self.executions
                .update_status(&execution_id, status, error)
                .await,
            "final status",
        );
        info!(
            execution_id = %execution_id,
            ?status,
            processed = final_stats.processed,
            failed = final_stats.failed,
            discovered = final_stats.discovered,
            extracted = final_stats.extracted,
            "crawl finished"
        );

        if let Some(e) = worker_error {
            return Err(e);
        }
        Ok(CrawlReport {
            execution_id,
            workflow_id: self.config.id.clone(),
            status,
            stats: final_stats,
        })
    }

    /// Periodic stats flush, independent of the claim/execute loop. Stops on
    /// the run's cancellation signal or when the run drains.
    fn spawn_stats_flusher(
        &self,
        execution_id: String,
        stats: Arc<SharedStats>,
        mut cancel: watch::Receiver<bool>,
        mut done: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let executions = self.executions.clone();
        let interval = self.stats_flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = executions.update_stats(&execution_id, stats.snapshot()).await {
                            warn!(error = %e, "stats flush failed");
                        }
                    }
                    Ok(()) = cancel.changed() => break,
                    _ = done.changed() => break,
                }
            }
        })
    }

    async fn worker_loop(
        &self,
        execution_id: &str,
        stats: &SharedStats,
        mut cancel: watch::Receiver<bool>,
        worker: usize,
    ) -> Result<()> {
        // Items whose phase cannot run yet are parked here instead of going
        // straight back to the queue: they stay `processing` and out of the
        // claim index, so the worker can reach lower-priority discovery work
        // instead of re-claiming the same gated item forever.
        let mut parked: Vec<UrlQueueItem> = Vec::new();

        let result = loop {
            if *cancel.borrow() {
                break Ok(());
            }
            let Some(item) = self.queue.dequeue(execution_id).await? else {
                if !parked.is_empty() {
                    self.release_parked(&mut parked).await?;
                    self.idle(&mut cancel).await;
                    continue;
                }
                if self.queue.active_count(execution_id).await? == 0 {
                    debug!(worker, "queue drained");
                    break Ok(());
                }
                self.idle(&mut cancel).await;
                continue;
            };

            let decision = match self.router.decide(&item, self.queue.as_ref()).await {
                Ok(decision) => decision,
                Err(CrawlError::NoMatchingPhase(url)) => {
                    warn!(worker, url = %url, "no phase matches, failing item");
                    self.queue
                        .mark_failed(&item.id, "no matching phase", false, 0)
                        .await?;
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => break Err(e),
            };

            match decision {
                RouteDecision::Requeue => {
                    debug!(worker, url = %item.url, "parked until discovery drains");
                    parked.push(item);
                }
                RouteDecision::Run(phase) => {
                    self.execute_item(item, phase, stats, &mut cancel).await?;
                    self.release_parked(&mut parked).await?;
                }
            }
        };

        // Whatever is still parked goes back as claimable before the worker
        // exits, keeping cancellation recoverable.
        self.release_parked(&mut parked).await?;
        result
    }

    async fn idle(&self, cancel: &mut watch::Receiver<bool>) {
        // A closed cancel channel means no cancellation is coming; keep the
        // polling backoff instead of waking immediately.
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            Ok(()) = cancel.changed() => {}
        }
    }

    async fn release_parked(&self, parked: &mut Vec<UrlQueueItem>) -> Result<()> {
        for item in parked.drain(..) {
            self.queue.requeue_for_later(&item.id).await?;
        }
        Ok(())
    }

    /// Process one claimed item whose phase is clear to run. Session
    /// acquisition happens here, after the routing gate, never before.
    async fn execute_item(
        &self,
        mut item: UrlQueueItem,
        phase: Arc<CompiledPhase>,
        stats: &SharedStats,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        if item.phase_id.is_none() {
            self.queue.assign_phase(&item.id, &phase.phase.id).await?;
            item.phase_id = Some(phase.phase.id.clone());
        }

        let session = tokio::select! {
            session = self.pool.acquire() => match session {
                Ok(session) => session,
                Err(e) => {
                    warn!(url = %item.url, error = %e, "session acquisition failed");
                    return self
                        .settle_failed(&item, &e.to_string(), !phase.phase.fatal, stats)
                        .await;
                }
            },
            Ok(()) = cancel.changed() => {
                // Leave the item processing; the resume path recovers it.
                return Ok(Outcome::Requeued);
            }
        };

        let mut result = self.run_phase(&item, &phase, session.clone(), stats).await;

        // One remediation per claim: the recovery collaborator may turn a
        // failure into an in-place retry.
        if let Err(e) = &result {
            if let Some(recovery) = &self.recovery {
                if let Some(remediation) = recovery.remediate(&item, e).await {
                    info!(url = %item.url, ?remediation, "applying remediation");
                    if let Remediation::Wait(delay) = remediation {
                        tokio::time::sleep(delay).await;
                    }
                    result = self.run_phase(&item, &phase, session.clone(), stats).await;
                }
            }
        }

        self.pool.release(session).await;

        match result {
            Ok(()) => {
                self.queue.mark_completed(&item.id).await?;
                stats.processed.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::Completed)
            }
            Err(e) => {
                warn!(url = %item.url, error = %e, "item failed");
                self.settle_failed(&item, &e.to_string(), !phase.phase.fatal, stats)
                    .await
            }
        }
    }

    /// Mark an item failed. Retryable failures go through the queue's retry
    /// ceiling and re-enter the frontier silently; a fatal phase makes every
    /// failure terminal. The failure only counts toward run stats once the
    /// item goes terminal.
    async fn settle_failed(
        &self,
        item: &UrlQueueItem,
        reason: &str,
        retryable: bool,
        stats: &SharedStats,
    ) -> Result<Outcome> {
        self.queue
            .mark_failed(&item.id, reason, retryable, self.config.max_item_retries)
            .await?;
        let terminal = matches!(
            self.queue.get(&item.id).await?.map(|i| i.status),
            Some(crate::model::UrlStatus::Failed)
        );
        if terminal {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Outcome::Failed(reason.to_string()))
    }

    async fn run_phase(
        &self,
        item: &UrlQueueItem,
        phase: &CompiledPhase,
        session: Arc<dyn BrowserSession>,
        stats: &SharedStats,
    ) -> Result<()> {
        session
            .navigate(&item.url)
            .await
            .map_err(|e| CrawlError::Navigation {
                url: item.url.clone(),
                message: e.to_string(),
            })?;
        if self.config.rate_limit_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.rate_limit_delay_ms)).await;
        }

        let ctx = ExecutionContext::for_item(item, &phase.phase.id);
        let order = phase.phase.build_graph()?.topological_sort()?;
        debug!(url = %item.url, phase = %phase.phase.id, nodes = order.len(), "running phase");

        let mut last_audit_id: Option<String> = None;
        for node_id in order {
            let node = phase
                .phase
                .node(&node_id)
                .ok_or_else(|| CrawlError::UnknownNode(node_id.clone()))?;
            match self
                .dispatch_node(item, node, session.clone(), &ctx, stats)
                .await
            {
                Ok(audit_id) => last_audit_id = Some(audit_id),
                Err(e) if node.optional => {
                    warn!(node = %node.id, error = %e, "optional node failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }

        if phase.phase.phase_type == PhaseType::Extraction {
            let record = ctx.extracted_record();
            if record.as_object().map_or(false, |o| !o.is_empty()) {
                let extracted = ExtractedItem::new(
                    item.execution_id.clone(),
                    item.id.clone(),
                    last_audit_id.clone(),
                    record,
                );
                self.persist(self.extracted.create(extracted).await, "extracted item");
                stats.extracted.fetch_add(1, Ordering::Relaxed);
                if let Some(audit_id) = &last_audit_id {
                    if let Ok(Some(mut run)) = self.node_runs.get_by_id(audit_id).await {
                        run.items_extracted = 1;
                        self.persist(self.node_runs.update(run).await, "node execution update");
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch one node with its own bounded retry policy, keeping the
    /// audit record current. Returns the audit id on success.
    async fn dispatch_node(
        &self,
        item: &UrlQueueItem,
        node: &crate::config::NodeSpec,
        session: Arc<dyn BrowserSession>,
        ctx: &ExecutionContext,
        stats: &SharedStats,
    ) -> Result<String> {
        let executor = self.registry.get(&node.node_type)?;
        let audit = NodeExecution::start(
            item.execution_id.clone(),
            node.id.clone(),
            item.id.clone(),
            Some(node.params.clone()),
        );
        let audit_id = audit.id.clone();
        self.persist(self.node_runs.create(audit).await, "node execution create");

        let attempts = node.retry.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let input = NodeInput {
                node_id: node.id.clone(),
                params: node.params.clone(),
                item: item.clone(),
                session: session.clone(),
                ctx: ctx.clone(),
            };
            match executor.execute(&input).await {
                Ok(output) => {
                    let discovered = self
                        .enqueue_discovered(item, &node.id, output.discovered, &session, stats)
                        .await?;
                    if let Some(value) = output.value {
                        let key = node.output_key.as_deref().unwrap_or(&node.id);
                        ctx.insert_value(key, value.clone());
                        self.persist(
                            self.node_runs
                                .mark_completed(&audit_id, Some(value), discovered as u32, 0)
                                .await,
                            "node execution complete",
                        );
                    } else {
                        self.persist(
                            self.node_runs
                                .mark_completed(&audit_id, None, discovered as u32, 0)
                                .await,
                            "node execution complete",
                        );
                    }
                    return Ok(audit_id);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        node = %node.id,
                        attempt,
                        max = attempts,
                        error = %e,
                        "node attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(node.retry.delay_ms)).await;
                }
                Err(e) => {
                    self.persist(
                        self.node_runs
                            .mark_failed(&audit_id, &e.to_string(), attempt - 1)
                            .await,
                        "node execution fail",
                    );
                    return Err(CrawlError::node_execution(&node.id, e));
                }
            }
        }
    }

    /// Resolve discovered URLs against the page base, filter, and enqueue
    /// them as children with hierarchy metadata.
    async fn enqueue_discovered(
        &self,
        parent: &UrlQueueItem,
        node_id: &str,
        discovered: Vec<crate::registry::DiscoveredUrl>,
        session: &Arc<dyn BrowserSession>,
        stats: &SharedStats,
    ) -> Result<usize> {
        if discovered.is_empty() {
            return Ok(0);
        }
        if let Some(max_depth) = self.config.max_depth {
            if parent.depth + 1 > max_depth {
                debug!(url = %parent.url, "max depth reached, dropping discovered urls");
                return Ok(0);
            }
        }
        let base = match session.current_url().await {
            Ok(url) => url,
            Err(_) => parent.url.clone(),
        };
        let base = Url::parse(&base).map_err(|e| CrawlError::Navigation {
            url: base,
            message: e.to_string(),
        })?;

        let mut enqueued = 0;
        for candidate in discovered {
            let resolved = match base.join(&candidate.url) {
                Ok(url) => url,
                Err(e) => {
                    debug!(href = %candidate.url, error = %e, "dropping unresolvable link");
                    continue;
                }
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let child = UrlQueueItem::child(
                parent,
                resolved.to_string(),
                node_id,
                candidate.marker,
                candidate.priority,
            );
            // The queue's per-execution URL index drops repeats, including
            // re-discoveries from a retried phase.
            if self.queue.enqueue_if_new(child).await?.is_some() {
                enqueued += 1;
            }
        }
        stats.discovered.fetch_add(enqueued as u64, Ordering::Relaxed);
        Ok(enqueued)
    }

    /// Persistence is a best-effort side channel; failures are logged and
    /// never block the crawl.
    fn persist<T>(&self, result: Result<T>, what: &str) {
        if let Err(e) = result {
            warn!(error = %e, what, "persistence write failed");
        }
    }
}
