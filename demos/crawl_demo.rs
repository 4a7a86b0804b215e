//! Runs a two-phase shop crawl against a canned browser pool.
//!
//! cargo run --example crawl_demo

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crawlflow::{
    nodes, BrowserPool, BrowserSession, CrawlError, CrawlExecutor, NodeRegistry, PageResponse,
    SelectorExtractor, SledUrlQueue, WorkflowConfig,
};

const WORKFLOW: &str = r#"
name: shop-demo
start_urls:
  - https://shop.example/catalog
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

/// Canned pages: selector -> hrefs, selector -> text.
struct DemoSession {
    pages: Arc<HashMap<String, (Vec<String>, Option<String>)>>,
    current: tokio::sync::Mutex<String>,
}

#[async_trait]
impl BrowserSession for DemoSession {
    async fn navigate(&self, url: &str) -> crawlflow::Result<PageResponse> {
        if !self.pages.contains_key(url) {
            return Err(CrawlError::Navigation {
                url: url.to_string(),
                message: "not found".to_string(),
            });
        }
        *self.current.lock().await = url.to_string();
        Ok(PageResponse {
            final_url: url.to_string(),
            status: 200,
        })
    }

    async fn current_url(&self) -> crawlflow::Result<String> {
        Ok(self.current.lock().await.clone())
    }

    async fn query_text(&self, _selector: &str) -> crawlflow::Result<Option<String>> {
        let current = self.current.lock().await.clone();
        Ok(self.pages.get(&current).and_then(|(_, text)| text.clone()))
    }

    async fn query_all(&self, _selector: &str, _attribute: &str) -> crawlflow::Result<Vec<String>> {
        let current = self.current.lock().await.clone();
        Ok(self
            .pages
            .get(&current)
            .map(|(links, _)| links.clone())
            .unwrap_or_default())
    }

    async fn click(&self, _selector: &str) -> crawlflow::Result<()> {
        Ok(())
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> crawlflow::Result<bool> {
        Ok(true)
    }
}

struct DemoPool {
    pages: Arc<HashMap<String, (Vec<String>, Option<String>)>>,
}

#[async_trait]
impl BrowserPool for DemoPool {
    async fn acquire(&self) -> crawlflow::Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(DemoSession {
            pages: self.pages.clone(),
            current: tokio::sync::Mutex::new(String::new()),
        }))
    }

    async fn release(&self, _session: Arc<dyn BrowserSession>) {}
}

fn demo_pages() -> HashMap<String, (Vec<String>, Option<String>)> {
    let mut pages = HashMap::new();
    pages.insert(
        "https://shop.example/catalog".to_string(),
        (vec!["/p/1".to_string(), "/p/2".to_string()], None),
    );
    pages.insert(
        "https://shop.example/p/1".to_string(),
        (vec![], Some("Walnut Desk".to_string())),
    );
    pages.insert(
        "https://shop.example/p/2".to_string(),
        (vec![], Some("Oak Shelf".to_string())),
    );
    pages
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = tempfile::tempdir()?;
    let queue = Arc::new(SledUrlQueue::open(dir.path().join("queue"))?);
    let registry = NodeRegistry::new();
    nodes::register_builtins(&registry, Arc::new(SelectorExtractor))?;

    let config = WorkflowConfig::from_yaml(WORKFLOW)?;
    let pool = Arc::new(DemoPool {
        pages: Arc::new(demo_pages()),
    });
    let executor = CrawlExecutor::new(config, registry, queue, pool)?.with_workers(2);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = executor.run(cancel_rx).await?;
    info!(
        execution_id = %report.execution_id,
        processed = report.stats.processed,
        discovered = report.stats.discovered,
        extracted = report.stats.extracted,
        "demo crawl finished"
    );
    Ok(())
}
