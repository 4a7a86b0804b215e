//! External collaborator interfaces consumed by the core.
//!
//! The browser pool, the extraction pipeline and the error-recovery service
//! live outside this crate; the executor and the built-in nodes only see the
//! traits below.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CrawlError, Result};
use crate::model::UrlQueueItem;

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub final_url: String,
    pub status: u16,
}

/// One live browser session / page. Nodes run strictly sequentially on a
/// session, so implementations do not need interior ordering guarantees.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<PageResponse>;

    /// URL of the currently loaded page; the base for resolving discovered
    /// relative links.
    async fn current_url(&self) -> Result<String>;

    /// Text content of the first element matching `selector`.
    async fn query_text(&self, selector: &str) -> Result<Option<String>>;

    /// Attribute values of every element matching `selector`.
    async fn query_all(&self, selector: &str, attribute: &str) -> Result<Vec<String>>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Wait until `selector` appears; `Ok(false)` on timeout.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool>;
}

/// Session pool with a hard cap on concurrently open sessions. `acquire`
/// blocks until a session is free; recycling broken sessions is the pool's
/// own concern.
#[async_trait]
pub trait BrowserPool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn BrowserSession>>;
    async fn release(&self, session: Arc<dyn BrowserSession>);
}

/// Selection config handed to the extraction collaborator. The transform
/// chain is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub transforms: Vec<String>,
}

/// CSS/attribute extraction-and-transform pipeline.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, session: &dyn BrowserSession, config: &ExtractConfig)
        -> Result<Value>;
}

/// A plain extractor that reads text or attributes straight off the page,
/// applying no transforms. Enough for workflows that don't wire a richer
/// pipeline.
pub struct SelectorExtractor;

#[async_trait]
impl Extractor for SelectorExtractor {
    async fn extract(
        &self,
        session: &dyn BrowserSession,
        config: &ExtractConfig,
    ) -> Result<Value> {
        if config.multiple {
            let attribute = config.attribute.as_deref().unwrap_or("textContent");
            let values = session.query_all(&config.selector, attribute).await?;
            Ok(Value::from(values))
        } else if let Some(attribute) = &config.attribute {
            let values = session.query_all(&config.selector, attribute).await?;
            match values.into_iter().next() {
                Some(v) => Ok(Value::from(v)),
                None => Ok(Value::Null),
            }
        } else {
            match session.query_text(&config.selector).await? {
                Some(text) => Ok(Value::from(text)),
                None => Err(CrawlError::Extraction(format!(
                    "no element matched '{}'",
                    config.selector
                ))),
            }
        }
    }
}

/// Remediation returned by the error-recovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    /// Pause, then retry the same item in place.
    Wait(Duration),
    /// Retry immediately with replacement session parameters.
    AdjustSession(HashMap<String, String>),
}

/// Pattern/rule matcher consulted on navigation or node failure. Returning
/// `Some` makes the executor retry the item instead of failing it (at most
/// once per claim).
#[async_trait]
pub trait ErrorRecovery: Send + Sync {
    async fn remediate(&self, item: &UrlQueueItem, error: &CrawlError) -> Option<Remediation>;
}
