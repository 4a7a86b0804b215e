//! End-to-end orchestration tests against a canned browser pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as TestResult;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use crawlflow::{
    BrowserPool, BrowserSession, CrawlError, CrawlExecutor, ExecutionStatus, MemoryExecutionRepo,
    MemoryExtractedItemsRepo, MemoryNodeExecutionRepo, NodeRegistry, NodeRunStatus, PageResponse,
    PhaseRouter, Result, RouteDecision, SelectorExtractor, SledUrlQueue, UrlQueue, UrlQueueItem,
    UrlStatus, WorkflowConfig,
};

/// One canned page: links per selector and text per selector.
#[derive(Default, Clone)]
struct StubPage {
    links: HashMap<&'static str, Vec<&'static str>>,
    texts: HashMap<&'static str, &'static str>,
}

struct StubSession {
    pages: Arc<HashMap<String, StubPage>>,
    current: tokio::sync::Mutex<String>,
}

impl StubSession {
    async fn page(&self) -> Result<StubPage> {
        let current = self.current.lock().await.clone();
        self.pages
            .get(&current)
            .cloned()
            .ok_or_else(|| CrawlError::Session(format!("no page loaded for {}", current)))
    }
}

#[async_trait]
impl BrowserSession for StubSession {
    async fn navigate(&self, url: &str) -> Result<PageResponse> {
        if !self.pages.contains_key(url) {
            return Err(CrawlError::Navigation {
                url: url.to_string(),
                message: "404".to_string(),
            });
        }
        *self.current.lock().await = url.to_string();
        Ok(PageResponse {
            final_url: url.to_string(),
            status: 200,
        })
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current.lock().await.clone())
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.page().await?.texts.get(selector).map(|t| t.to_string()))
    }

    async fn query_all(&self, selector: &str, _attribute: &str) -> Result<Vec<String>> {
        Ok(self
            .page()
            .await?
            .links
            .get(selector)
            .map(|v| v.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default())
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

struct StubPool {
    pages: Arc<HashMap<String, StubPage>>,
}

impl StubPool {
    fn new(pages: HashMap<String, StubPage>) -> Arc<Self> {
        Arc::new(Self {
            pages: Arc::new(pages),
        })
    }
}

#[async_trait]
impl BrowserPool for StubPool {
    async fn acquire(&self) -> Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(StubSession {
            pages: self.pages.clone(),
            current: tokio::sync::Mutex::new(String::new()),
        }))
    }

    async fn release(&self, _session: Arc<dyn BrowserSession>) {}
}

struct Harness {
    executor: CrawlExecutor,
    queue: Arc<SledUrlQueue>,
    node_runs: Arc<MemoryNodeExecutionRepo>,
    extracted: Arc<MemoryExtractedItemsRepo>,
    _dir: tempfile::TempDir,
}

fn harness(config_yaml: &str, pages: HashMap<String, StubPage>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(SledUrlQueue::open(dir.path().join("queue")).unwrap());
    let registry = NodeRegistry::new();
    crawlflow::nodes::register_builtins(&registry, Arc::new(SelectorExtractor)).unwrap();

    let node_runs = MemoryNodeExecutionRepo::new();
    let extracted = MemoryExtractedItemsRepo::new();
    let executions = MemoryExecutionRepo::new();

    let config = WorkflowConfig::from_yaml(config_yaml).unwrap();
    let executor = CrawlExecutor::new(config, registry, queue.clone(), StubPool::new(pages))
        .unwrap()
        .with_repos(node_runs.clone(), extracted.clone(), executions)
        .with_poll_interval(Duration::from_millis(10));

    Harness {
        executor,
        queue,
        node_runs,
        extracted,
        _dir: dir,
    }
}

fn page(
    links: &[(&'static str, &[&'static str])],
    texts: &[(&'static str, &'static str)],
) -> StubPage {
    StubPage {
        links: links.iter().map(|(k, v)| (*k, v.to_vec())).collect(),
        texts: texts.iter().cloned().collect(),
    }
}

const SHOP_WORKFLOW: &str = r#"
name: shop
start_urls:
  - https://shop.example/catalog
rate_limit_delay_ms: 0
phases:
  - id: discover
    type: discovery
    nodes:
      - id: links
        type: discover_links
        params:
          selector: "a.item"
          marker: item
  - id: extract
    type: extraction
    url_filter:
      markers: [item]
    nodes:
      - id: title
        type: extract
        params:
          selector: h1
        output_key: title
"#;

fn shop_pages() -> HashMap<String, StubPage> {
    let mut pages = HashMap::new();
    pages.insert(
        "https://shop.example/catalog".to_string(),
        page(&[("a.item", &["/p/1", "/p/2", "/p/3"])], &[]),
    );
    for i in 1..=3 {
        pages.insert(
            format!("https://shop.example/p/{}", i),
            page(&[], &[("h1", ["Alpha", "Beta", "Gamma"][i - 1])]),
        );
    }
    pages
}

#[tokio::test]
async fn seed_to_extraction_end_to_end() -> TestResult<()> {
    let h = harness(SHOP_WORKFLOW, shop_pages());
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await?;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.stats.processed, 4);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.discovered, 3);
    assert_eq!(report.stats.extracted, 3);

    let items = h.queue.items(&report.execution_id).await?;
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.status == UrlStatus::Completed));
    assert!(items.iter().all(|i| i.retry_count == 0));

    let seed = items.iter().find(|i| i.depth == 0).unwrap();
    assert!(seed.parent_url_id.is_none());
    let children: Vec<_> = items.iter().filter(|i| i.depth == 1).collect();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.parent_url_id.as_deref(), Some(seed.id.as_str()));
        assert_eq!(child.discovered_by_node.as_deref(), Some("links"));
        assert_eq!(child.marker.as_deref(), Some("item"));
        assert_eq!(child.phase_id.as_deref(), Some("extract"));
    }

    let mut titles: Vec<String> = h
        .extracted
        .all()
        .into_iter()
        .map(|e| e.data["title"].as_str().unwrap().to_string())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Alpha", "Beta", "Gamma"]);
    Ok(())
}

#[tokio::test]
async fn extraction_waits_for_discovery_to_drain() {
    // Item-marked children outrank the section child, so a single worker
    // claims them first and must requeue them until discovery finishes.
    let config = r#"
name: gated
start_urls:
  - https://shop.example/catalog
phases:
  - id: discover
    type: discovery
    url_filter:
      markers: [section]
    nodes:
      - id: sections
        type: discover_links
        params:
          selector: "a.section"
          marker: section
      - id: items
        type: discover_links
        params:
          selector: "a.item"
          marker: item
          priority: 50
        dependencies: [sections]
  - id: extract
    type: extraction
    url_filter:
      markers: [item]
    nodes:
      - id: title
        type: extract
        params:
          selector: h1
        output_key: title
"#;
    let mut pages = HashMap::new();
    pages.insert(
        "https://shop.example/catalog".to_string(),
        page(
            &[("a.section", &["/s/1"]), ("a.item", &["/p/1", "/p/2"])],
            &[],
        ),
    );
    pages.insert("https://shop.example/s/1".to_string(), page(&[], &[]));
    pages.insert(
        "https://shop.example/p/1".to_string(),
        page(&[], &[("h1", "Alpha")]),
    );
    pages.insert(
        "https://shop.example/p/2".to_string(),
        page(&[], &[("h1", "Beta")]),
    );

    let h = harness(config, pages);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.stats.processed, 4);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.extracted, 2);

    let items = h.queue.items(&report.execution_id).await.unwrap();
    assert!(items.iter().all(|i| i.status == UrlStatus::Completed));
    // Requeues while gated must never look like retries.
    assert!(items.iter().all(|i| i.retry_count == 0));
}

#[tokio::test]
async fn gating_decision_requeues_until_discovery_completes() {
    let config = WorkflowConfig::from_yaml(SHOP_WORKFLOW).unwrap();
    let router = PhaseRouter::new(&config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let queue = SledUrlQueue::open(dir.path().join("queue")).unwrap();

    let seed = UrlQueueItem::seed("exec", "https://shop.example/catalog", 100);
    let seed_id = queue.enqueue(seed.clone()).await.unwrap();
    let product = UrlQueueItem::child(
        &seed,
        "https://shop.example/p/1",
        "links",
        Some("item".to_string()),
        0,
    );
    queue.enqueue(product).await.unwrap();

    // Claim the extraction item while the seed (a discovery item) is pending.
    let seed_claim = queue.dequeue("exec").await.unwrap().unwrap();
    assert_eq!(seed_claim.id, seed_id);
    let product_claim = queue.dequeue("exec").await.unwrap().unwrap();
    assert!(matches!(
        router.decide(&product_claim, &queue).await.unwrap(),
        RouteDecision::Requeue
    ));

    // Discovery finishes; the same item now routes to its phase.
    queue.mark_completed(&seed_id).await.unwrap();
    assert!(matches!(
        router.decide(&product_claim, &queue).await.unwrap(),
        RouteDecision::Run(_)
    ));
}

#[tokio::test]
async fn optional_node_failure_does_not_abort_the_phase() {
    let config = r#"
name: partial
start_urls:
  - https://shop.example/p/1
phases:
  - id: extract
    type: extraction
    nodes:
      - id: missing
        type: extract
        optional: true
        params:
          selector: h9
        output_key: subtitle
      - id: title
        type: extract
        params:
          selector: h1
        output_key: title
        dependencies: [missing]
"#;
    let mut pages = HashMap::new();
    pages.insert(
        "https://shop.example/p/1".to_string(),
        page(&[], &[("h1", "Alpha")]),
    );

    let h = harness(config, pages);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await.unwrap();

    assert_eq!(report.stats.processed, 1);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.extracted, 1);

    let record = &h.extracted.all()[0];
    assert_eq!(record.data["title"], "Alpha");
    assert!(record.data.get("subtitle").is_none());

    let runs = h.node_runs.all();
    let failed: Vec<_> = runs
        .iter()
        .filter(|r| r.status == NodeRunStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].node_id, "missing");
}

#[tokio::test]
async fn required_node_failure_retries_then_goes_terminal() {
    let config = r#"
name: failing
start_urls:
  - https://shop.example/p/1
max_item_retries: 1
phases:
  - id: extract
    type: extraction
    nodes:
      - id: title
        type: extract
        params:
          selector: h9
        output_key: title
"#;
    let mut pages = HashMap::new();
    pages.insert("https://shop.example/p/1".to_string(), page(&[], &[]));

    let h = harness(config, pages);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.stats.processed, 0);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.extracted, 0);

    let items = h.queue.items(&report.execution_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, UrlStatus::Failed);
    assert_eq!(items[0].retry_count, 1);
    assert!(items[0].error.as_deref().unwrap().contains("title"));
}

#[tokio::test]
async fn retried_discovery_does_not_duplicate_children() {
    // Discovery succeeds, then a required node fails; the retry re-runs the
    // whole phase and re-reports the same links. The frontier must still
    // hold each child once.
    let config = r#"
name: retry-dup
start_urls:
  - https://shop.example/catalog
max_item_retries: 1
phases:
  - id: discover
    type: discovery
    nodes:
      - id: links
        type: discover_links
        params:
          selector: "a.item"
          marker: item
      - id: summary
        type: extract
        dependencies: [links]
        params:
          selector: h1
  - id: extract
    type: extraction
    url_filter:
      markers: [item]
    nodes:
      - id: title
        type: extract
        params:
          selector: h1
        output_key: title
"#;
    let mut pages = HashMap::new();
    // The catalog has links but no h1, so `summary` fails every attempt.
    pages.insert(
        "https://shop.example/catalog".to_string(),
        page(&[("a.item", &["/p/1", "/p/2"])], &[]),
    );
    pages.insert(
        "https://shop.example/p/1".to_string(),
        page(&[], &[("h1", "Alpha")]),
    );
    pages.insert(
        "https://shop.example/p/2".to_string(),
        page(&[], &[("h1", "Beta")]),
    );

    let h = harness(config, pages);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await.unwrap();

    assert_eq!(report.stats.discovered, 2);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.extracted, 2);

    let items = h.queue.items(&report.execution_id).await.unwrap();
    assert_eq!(items.len(), 3);
    let catalog = items.iter().find(|i| i.depth == 0).unwrap();
    assert_eq!(catalog.status, UrlStatus::Failed);
    assert_eq!(catalog.retry_count, 1);
    let mut child_urls: Vec<&str> = items
        .iter()
        .filter(|i| i.depth == 1)
        .map(|i| i.url.as_str())
        .collect();
    child_urls.sort();
    assert_eq!(
        child_urls,
        vec!["https://shop.example/p/1", "https://shop.example/p/2"]
    );
}

#[tokio::test]
async fn resume_recovers_stranded_processing_items() -> TestResult<()> {
    let h = harness(SHOP_WORKFLOW, shop_pages());

    // A crashed run left the seed claimed but unfinished.
    let seed = UrlQueueItem::seed("prior-run", "https://shop.example/catalog", 100);
    h.queue.enqueue(seed).await?;
    let stranded = h.queue.dequeue("prior-run").await?.unwrap();
    assert_eq!(stranded.status, UrlStatus::Processing);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.resume("prior-run", cancel_rx).await?;

    assert_eq!(report.execution_id, "prior-run");
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.stats.processed, 4);

    // The seed was not re-added alongside the recovered item.
    let items = h.queue.items("prior-run").await?;
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.status == UrlStatus::Completed));
    Ok(())
}

#[tokio::test]
async fn fatal_phase_failure_skips_retries() {
    let config = r#"
name: fatal
start_urls:
  - https://shop.example/p/1
max_item_retries: 3
phases:
  - id: extract
    type: extraction
    fatal: true
    nodes:
      - id: title
        type: extract
        params:
          selector: h9
        output_key: title
"#;
    let mut pages = HashMap::new();
    pages.insert("https://shop.example/p/1".to_string(), page(&[], &[]));

    let h = harness(config, pages);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = h.executor.run(cancel_rx).await.unwrap();

    assert_eq!(report.stats.failed, 1);
    let items = h.queue.items(&report.execution_id).await.unwrap();
    assert_eq!(items[0].status, UrlStatus::Failed);
    // One attempt, no retry ceiling consumed.
    assert_eq!(items[0].retry_count, 0);
}

#[tokio::test]
async fn dropped_cancel_sender_leaves_run_uncancelled() {
    let h = harness(SHOP_WORKFLOW, shop_pages());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    drop(cancel_tx);

    let report = h.executor.run(cancel_rx).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.stats.processed, 4);
}

#[tokio::test]
async fn cancellation_stops_claiming_promptly() {
    let config = r#"
name: slow
start_urls:
  - https://shop.example/catalog
rate_limit_delay_ms: 100
phases:
  - id: discover
    type: discovery
    nodes:
      - id: links
        type: discover_links
        params:
          selector: "a.item"
          marker: item
  - id: extract
    type: extraction
    url_filter:
      markers: [item]
    nodes:
      - id: title
        type: extract
        params:
          selector: h1
"#;
    let mut pages = HashMap::new();
    let hrefs: Vec<&'static str> = (0..20)
        .map(|i| &*Box::leak(format!("/p/{}", i).into_boxed_str()))
        .collect();
    pages.insert(
        "https://shop.example/catalog".to_string(),
        StubPage {
            links: [("a.item", hrefs.clone())].into_iter().collect(),
            texts: HashMap::new(),
        },
    );
    for href in &hrefs {
        pages.insert(
            format!("https://shop.example{}", href),
            page(&[], &[("h1", "X")]),
        );
    }

    let h = harness(config, pages);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let run = tokio::spawn({
        let executor = h.executor.clone();
        async move { executor.run(cancel_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(250)).await;
    cancel_tx.send(true).unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, ExecutionStatus::Cancelled);
    assert!(report.stats.processed < 21);
}
