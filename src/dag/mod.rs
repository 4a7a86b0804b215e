//! Dependency graph for a phase's node list.
//!
//! Pure data structure: nodes are added in declaration order, edges come from
//! dependency lists, and `topological_sort` yields the execution order via
//! Kahn's algorithm.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{CrawlError, Result};

/// Directed graph of node ids. Edge `a -> b` means `b` depends on `a`.
pub struct NodeGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    /// Declaration order, used as the deterministic tie-break.
    order: Vec<NodeIndex>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Build the graph for a list of `(id, dependencies)` pairs, as they
    /// appear in a phase's node list.
    pub fn from_dependencies<'a, I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<_> = nodes.into_iter().collect();
        let mut dag = Self::new();
        for (id, _) in &nodes {
            dag.add_node(id)?;
        }
        for (id, deps) in &nodes {
            for dep in deps.iter() {
                dag.add_edge(dep, id)?;
            }
        }
        Ok(dag)
    }

    pub fn add_node(&mut self, id: &str) -> Result<()> {
        if self.indices.contains_key(id) {
            return Err(CrawlError::InvalidConfig(format!(
                "duplicate node id '{}'",
                id
            )));
        }
        let idx = self.graph.add_node(id.to_string());
        self.indices.insert(id.to_string(), idx);
        self.order.push(idx);
        Ok(())
    }

    /// Add edge `from -> to`; both endpoints must already exist.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let a = *self
            .indices
            .get(from)
            .ok_or_else(|| CrawlError::UnknownNode(from.to_string()))?;
        let b = *self
            .indices
            .get(to)
            .ok_or_else(|| CrawlError::UnknownNode(to.to_string()))?;
        self.graph.add_edge(a, b, ());
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    /// Nodes with no incoming edge, in declaration order.
    pub fn root_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|&&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|&idx| self.graph[idx].clone())
            .collect()
    }

    /// Kahn's algorithm. Ties among zero-in-degree nodes break by declaration
    /// order, so the result is stable across runs (never incidental map
    /// iteration order). Returns `CycleDetected` naming one node still stuck
    /// in a cycle when the graph is not a DAG.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .order
            .iter()
            .map(|&idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        loop {
            // First ready node in declaration order.
            let next = self
                .order
                .iter()
                .find(|&&idx| in_degree.get(&idx) == Some(&0))
                .copied();
            let Some(idx) = next else { break };
            in_degree.remove(&idx);
            sorted.push(self.graph[idx].clone());
            for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(d) = in_degree.get_mut(&succ) {
                    *d = d.saturating_sub(1);
                }
            }
        }

        if sorted.len() < self.graph.node_count() {
            let stuck = self
                .order
                .iter()
                .find(|&&idx| in_degree.contains_key(&idx))
                .map(|&idx| self.graph[idx].clone())
                .unwrap_or_default();
            return Err(CrawlError::CycleDetected(stuck));
        }
        Ok(sorted)
    }
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}
