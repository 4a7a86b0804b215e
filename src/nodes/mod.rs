//! Built-in node executors.
//!
//! Each executor decodes the node's opaque `params` into its own typed
//! struct; `validate` proves the configured params decode before a run
//! starts, so execution never does ad hoc key lookups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{CrawlError, Result};
use crate::registry::{DiscoveredUrl, NodeExecutor, NodeInput, NodeOutput, NodeRegistry};
use crate::session::{ExtractConfig, Extractor};

fn decode_params<T: Default + DeserializeOwned>(node_id: &str, params: &Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .map_err(|e| CrawlError::node_validation(node_id, e))
}

fn default_wait_timeout_ms() -> u64 {
    5_000
}

/// `navigate` — load a URL into the session. Defaults to the queue item's
/// own URL, which is what nearly every phase's root node wants.
pub struct NavigateExecutor;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NavigateParams {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    wait_for: Option<String>,
    #[serde(default = "default_wait_timeout_ms")]
    wait_timeout_ms: u64,
}

#[async_trait]
impl NodeExecutor for NavigateExecutor {
    fn node_type(&self) -> &str {
        "navigate"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        decode_params::<NavigateParams>("navigate", params).map(|_| ())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let params: NavigateParams = decode_params(&input.node_id, &input.params)?;
        let url = params.url.as_deref().unwrap_or(&input.item.url);
        let response = input.session.navigate(url).await?;
        if let Some(selector) = &params.wait_for {
            input
                .session
                .wait_for(selector, Duration::from_millis(params.wait_timeout_ms))
                .await?;
        }
        Ok(NodeOutput::value(json!({
            "final_url": response.final_url,
            "status": response.status,
        })))
    }
}

/// `discover_links` — collect attribute values from matching elements and
/// report them as new frontier URLs tagged with this node's marker.
pub struct DiscoverLinksExecutor;

fn default_href() -> String {
    "href".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiscoverLinksParams {
    selector: String,
    #[serde(default = "default_href")]
    attribute: String,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    priority: i32,
    /// Optional regex keeping only matching URLs.
    #[serde(default)]
    pattern: Option<String>,
}

impl Default for DiscoverLinksParams {
    fn default() -> Self {
        Self {
            selector: String::new(),
            attribute: default_href(),
            marker: None,
            priority: 0,
            pattern: None,
        }
    }
}

#[async_trait]
impl NodeExecutor for DiscoverLinksExecutor {
    fn node_type(&self) -> &str {
        "discover_links"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let params: DiscoverLinksParams = decode_params("discover_links", params)?;
        if params.selector.trim().is_empty() {
            return Err(CrawlError::node_validation(
                "discover_links",
                "selector is required",
            ));
        }
        if let Some(pattern) = &params.pattern {
            Regex::new(pattern).map_err(|e| CrawlError::node_validation("discover_links", e))?;
        }
        Ok(())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let params: DiscoverLinksParams = decode_params(&input.node_id, &input.params)?;
        let hrefs = input
            .session
            .query_all(&params.selector, &params.attribute)
            .await?;
        let filter = match &params.pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| CrawlError::node_execution(&input.node_id, e))?),
            None => None,
        };
        let discovered: Vec<DiscoveredUrl> = hrefs
            .into_iter()
            .filter(|href| !href.trim().is_empty())
            .filter(|href| filter.as_ref().map_or(true, |re| re.is_match(href)))
            .map(|url| DiscoveredUrl {
                url,
                marker: params.marker.clone(),
                priority: params.priority,
            })
            .collect();
        debug!(node = %input.node_id, count = discovered.len(), "links discovered");
        let count = discovered.len();
        let mut output = NodeOutput::discovered(discovered);
        output.value = Some(json!({ "count": count }));
        Ok(output)
    }
}

/// `extract` — delegate to the extraction collaborator and return its value.
pub struct ExtractExecutor {
    extractor: Arc<dyn Extractor>,
}

impl ExtractExecutor {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl NodeExecutor for ExtractExecutor {
    fn node_type(&self) -> &str {
        "extract"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let config: ExtractConfig = serde_json::from_value(params.clone())
            .map_err(|e| CrawlError::node_validation("extract", e))?;
        if config.selector.trim().is_empty() {
            return Err(CrawlError::node_validation("extract", "selector is required"));
        }
        Ok(())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let config: ExtractConfig = serde_json::from_value(input.params.clone())
            .map_err(|e| CrawlError::node_execution(&input.node_id, e))?;
        let value = self.extractor.extract(input.session.as_ref(), &config).await?;
        Ok(NodeOutput::value(value))
    }
}

/// `click` — interact with an element, optionally pausing afterwards for
/// scripted content to settle.
pub struct ClickExecutor;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClickParams {
    selector: String,
    #[serde(default)]
    wait_after_ms: u64,
}

#[async_trait]
impl NodeExecutor for ClickExecutor {
    fn node_type(&self) -> &str {
        "click"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let params: ClickParams = decode_params("click", params)?;
        if params.selector.trim().is_empty() {
            return Err(CrawlError::node_validation("click", "selector is required"));
        }
        Ok(())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let params: ClickParams = decode_params(&input.node_id, &input.params)?;
        input.session.click(&params.selector).await?;
        if params.wait_after_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.wait_after_ms)).await;
        }
        Ok(NodeOutput::empty())
    }
}

/// `paginate` — follow a next-page link, reporting the next page as a
/// discovered URL so it re-enters the frontier with hierarchy intact.
pub struct PaginateExecutor;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PaginateParams {
    selector: String,
    #[serde(default = "default_href")]
    attribute: String,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    priority: i32,
}

#[async_trait]
impl NodeExecutor for PaginateExecutor {
    fn node_type(&self) -> &str {
        "paginate"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let params: PaginateParams = decode_params("paginate", params)?;
        if params.selector.trim().is_empty() {
            return Err(CrawlError::node_validation("paginate", "selector is required"));
        }
        Ok(())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let params: PaginateParams = decode_params(&input.node_id, &input.params)?;
        let mut hrefs = input
            .session
            .query_all(&params.selector, &params.attribute)
            .await?;
        let Some(next) = hrefs.drain(..).find(|h| !h.trim().is_empty()) else {
            // Last page.
            return Ok(NodeOutput::value(Value::Null));
        };
        let mut output = NodeOutput::value(Value::from(next.clone()));
        output.discovered.push(DiscoveredUrl {
            url: next,
            marker: params.marker.clone(),
            priority: params.priority,
        });
        Ok(output)
    }
}

/// `wait` — explicit suspension point: wait for a selector or a fixed delay.
pub struct WaitExecutor;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WaitParams {
    #[serde(default)]
    selector: Option<String>,
    #[serde(default = "default_wait_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    delay_ms: u64,
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            selector: None,
            timeout_ms: default_wait_timeout_ms(),
            delay_ms: 0,
        }
    }
}

#[async_trait]
impl NodeExecutor for WaitExecutor {
    fn node_type(&self) -> &str {
        "wait"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        decode_params::<WaitParams>("wait", params).map(|_| ())
    }

    async fn execute(&self, input: &NodeInput) -> Result<NodeOutput> {
        let params: WaitParams = decode_params(&input.node_id, &input.params)?;
        if let Some(selector) = &params.selector {
            let found = input
                .session
                .wait_for(selector, Duration::from_millis(params.timeout_ms))
                .await?;
            return Ok(NodeOutput::value(json!({ "found": found })));
        }
        if params.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
        }
        Ok(NodeOutput::empty())
    }
}

/// Register every built-in executor on a registry.
pub fn register_builtins(registry: &NodeRegistry, extractor: Arc<dyn Extractor>) -> Result<()> {
    registry.register(Arc::new(NavigateExecutor))?;
    registry.register(Arc::new(DiscoverLinksExecutor))?;
    registry.register(Arc::new(ExtractExecutor::new(extractor)))?;
    registry.register(Arc::new(ClickExecutor))?;
    registry.register(Arc::new(PaginateExecutor))?;
    registry.register(Arc::new(WaitExecutor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigate_accepts_empty_params() {
        assert!(NavigateExecutor.validate(&Value::Null).is_ok());
        assert!(NavigateExecutor
            .validate(&json!({ "wait_for": "#content" }))
            .is_ok());
    }

    #[test]
    fn discover_links_requires_a_selector() {
        assert!(DiscoverLinksExecutor.validate(&Value::Null).is_err());
        assert!(DiscoverLinksExecutor
            .validate(&json!({ "selector": "a.item", "marker": "item" }))
            .is_ok());
    }

    #[test]
    fn discover_links_rejects_a_bad_pattern() {
        let params = json!({ "selector": "a", "pattern": "[unclosed" });
        assert!(DiscoverLinksExecutor.validate(&params).is_err());
    }

    #[test]
    fn unknown_param_keys_are_rejected_at_validation() {
        let params = json!({ "selector": "a", "selectr": "typo" });
        assert!(ClickExecutor.validate(&params).is_err());
    }
}
