//! Workflow configuration: the declarative document operators write.
//!
//! Loads from YAML or JSON (interchangeable) and validates the structural
//! rules before a run starts: at least one start URL, at least one phase,
//! unique node ids per phase, dependencies referencing known nodes, and no
//! dependency cycles.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::NodeGraph;
use crate::error::{CrawlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Discovery,
    Extraction,
    Interaction,
}

/// Retry policy for a single node: bounded attempts with a fixed delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// One DAG vertex as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Opaque here; each executor decodes this into its own typed params
    /// struct at validation time.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Name under which the node's result lands in the execution context;
    /// defaults to the node id.
    #[serde(default)]
    pub output_key: Option<String>,
}

/// Routing filter for a phase. Evaluated in order: marker membership, exact
/// depth, then regex patterns against the URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlFilter {
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub condition: String,
    pub next_phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: String,
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub url_filter: Option<UrlFilter>,
    #[serde(default)]
    pub transition: Option<PhaseTransition>,
    /// When set, any failure in this phase is terminal for the item; the
    /// retry ceiling does not apply.
    #[serde(default)]
    pub fatal: bool,
}

impl WorkflowPhase {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Dependency graph over this phase's node list.
    pub fn build_graph(&self) -> Result<NodeGraph> {
        NodeGraph::from_dependencies(
            self.nodes
                .iter()
                .map(|n| (n.id.as_str(), n.dependencies.as_slice())),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_id")]
    pub id: String,
    pub name: String,
    pub start_urls: Vec<String>,
    pub phases: Vec<WorkflowPhase>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Delay between page navigations, per worker.
    #[serde(default)]
    pub rate_limit_delay_ms: u64,
    #[serde(default)]
    pub max_depth: Option<u32>,
    /// Item-level retry ceiling for retryable failures.
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
}

fn default_workflow_id() -> String {
    cuid2::create_id()
}

fn default_max_item_retries() -> u32 {
    3
}

impl WorkflowConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(content)
            .map_err(|e| CrawlError::InvalidConfig(format!("yaml parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_json::from_str(content)
            .map_err(|e| CrawlError::InvalidConfig(format!("json parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, dispatching on extension (`.json` vs `.yaml`/`.yml`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn phase(&self, id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Structural validation. Executor-level param validation happens
    /// separately, once a registry is available.
    pub fn validate(&self) -> Result<()> {
        if self.start_urls.is_empty() {
            return Err(CrawlError::InvalidConfig(
                "workflow has no start URLs".to_string(),
            ));
        }
        if self.start_urls.iter().any(|u| u.trim().is_empty()) {
            return Err(CrawlError::InvalidConfig(
                "workflow has an empty start URL".to_string(),
            ));
        }
        if self.phases.is_empty() {
            return Err(CrawlError::InvalidConfig(
                "workflow has no phases".to_string(),
            ));
        }

        let mut phase_ids = std::collections::HashSet::new();
        for phase in &self.phases {
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(CrawlError::InvalidConfig(format!(
                    "duplicate phase id '{}'",
                    phase.id
                )));
            }
            if phase.nodes.is_empty() {
                return Err(CrawlError::InvalidConfig(format!(
                    "phase '{}' has no nodes",
                    phase.id
                )));
            }
            if let Some(filter) = &phase.url_filter {
                for pattern in &filter.patterns {
                    regex::Regex::new(pattern).map_err(|e| {
                        CrawlError::InvalidConfig(format!(
                            "phase '{}' has invalid pattern '{}': {}",
                            phase.id, pattern, e
                        ))
                    })?;
                }
            }
            if let Some(transition) = &phase.transition {
                if !self.phases.iter().any(|p| p.id == transition.next_phase) {
                    return Err(CrawlError::InvalidConfig(format!(
                        "phase '{}' transitions to unknown phase '{}'",
                        phase.id, transition.next_phase
                    )));
                }
            }
            // Duplicate ids, unknown dependencies and cycles all surface here.
            let graph = phase.build_graph().map_err(|e| match e {
                CrawlError::UnknownNode(n) => CrawlError::InvalidConfig(format!(
                    "phase '{}' references unknown dependency '{}'",
                    phase.id, n
                )),
                CrawlError::CycleDetected(n) => CrawlError::InvalidConfig(format!(
                    "phase '{}' has a dependency cycle involving '{}'",
                    phase.id, n
                )),
                other => other,
            })?;
            graph.topological_sort().map_err(|e| match e {
                CrawlError::CycleDetected(n) => CrawlError::InvalidConfig(format!(
                    "phase '{}' has a dependency cycle involving '{}'",
                    phase.id, n
                )),
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: shop-crawl
start_urls:
  - https://example.com/catalog
phases:
  - id: discover
    type: discovery
    nodes:
      - id: open
        type: navigate
      - id: links
        type: discover_links
        dependencies: [open]
        params:
          selector: "a.product"
          marker: product
  - id: extract
    type: extraction
    url_filter:
      markers: [product]
    nodes:
      - id: open
        type: navigate
      - id: title
        type: extract
        dependencies: [open]
        params:
          selector: h1
        output_key: title
"#;

    #[test]
    fn parses_yaml() {
        let config = WorkflowConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.phases[0].phase_type, PhaseType::Discovery);
        assert_eq!(
            config.phases[1].url_filter.as_ref().unwrap().markers,
            vec!["product"]
        );
    }

    #[test]
    fn json_and_yaml_are_interchangeable() {
        let yaml = WorkflowConfig::from_yaml(MINIMAL).unwrap();
        let json = serde_json::to_string(&yaml).unwrap();
        let back = WorkflowConfig::from_json(&json).unwrap();
        assert_eq!(back.phases.len(), yaml.phases.len());
    }

    #[test]
    fn rejects_missing_start_urls() {
        let doc = MINIMAL.replace(
            "start_urls:\n  - https://example.com/catalog",
            "start_urls: []",
        );
        assert!(matches!(
            WorkflowConfig::from_yaml(&doc),
            Err(CrawlError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let doc = MINIMAL.replace("dependencies: [open]", "dependencies: [nope]");
        let err = WorkflowConfig::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("unknown dependency"));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let doc = MINIMAL.replace("id: links", "id: open");
        let err = WorkflowConfig::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let doc = r#"
name: cyclic
start_urls: [https://example.com]
phases:
  - id: p
    type: discovery
    nodes:
      - id: a
        type: navigate
        dependencies: [b]
      - id: b
        type: navigate
        dependencies: [a]
"#;
        let err = WorkflowConfig::from_yaml(doc).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
