//! Dependency graph of plan nodes.
//!
//! Edges point from a prerequisite to the node that consumes its output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Node that must succeed first.
    pub from: String,
    /// Node that waits for it.
    pub to: String,
}

impl Dependency {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node id cannot be empty")]
    EmptyNodeId,

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("dependency references unknown node: {from} -> {to}")]
    UnknownNode { from: String, to: String },

    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    /// Node ids in declaration order.
    pub nodes: Vec<String>,
    pub edges: Vec<Dependency>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl TaskGraph {
    pub fn new(nodes: Vec<String>, edges: Vec<Dependency>) -> Self {
        Self { nodes, edges }
    }

    /// Unique non-empty ids, edges between known nodes, no cycles.
    /// Duplicate edges are tolerated.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for id in &self.nodes {
            if id.trim().is_empty() {
                return Err(GraphError::EmptyNodeId);
            }
            if !seen.insert(id.as_str()) {
                return Err(GraphError::DuplicateNode(id.clone()));
            }
        }
        for edge in &self.edges {
            if !seen.contains(edge.from.as_str()) || !seen.contains(edge.to.as_str()) {
                return Err(GraphError::UnknownNode {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }

        let adjacency = self.adjacency();
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for id in &self.nodes {
            if !marks.contains_key(id.as_str())
                && let Some(cycle) = find_cycle(id, &adjacency, &mut marks, &mut path)
            {
                return Err(GraphError::Cycle(cycle));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; among ready nodes, declaration order wins.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        self.validate()?;

        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in self.unique_edges() {
            in_degree[index[edge.to.as_str()]] += 1;
        }

        let adjacency = self.adjacency();
        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            let id = &self.nodes[i];
            order.push(id.clone());
            for next in adjacency.get(id.as_str()).into_iter().flatten() {
                let j = index[next];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        Ok(order)
    }

    /// Direct prerequisites of `node`.
    pub fn prerequisites(&self, node: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for edge in self.edges.iter().filter(|e| e.to == node) {
            if !out.contains(&edge.from.as_str()) {
                out.push(&edge.from);
            }
        }
        out
    }

    /// Every node reachable downstream of `node`, in declaration order.
    pub fn downstream(&self, node: &str) -> Vec<String> {
        let adjacency = self.adjacency();
        let mut reached: HashSet<&str> = HashSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for next in adjacency.get(current).into_iter().flatten() {
                if reached.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.nodes
            .iter()
            .filter(|id| reached.contains(id.as_str()))
            .cloned()
            .collect()
    }

    fn unique_edges(&self) -> impl Iterator<Item = &Dependency> {
        let mut seen = HashSet::new();
        self.edges.iter().filter(move |e| seen.insert(*e))
    }

    fn adjacency(&self) -> HashMap<&str, Vec<&str>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in self.unique_edges() {
            adjacency.entry(&edge.from).or_default().push(&edge.to);
        }
        adjacency
    }
}

fn find_cycle<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::Visiting);
    path.push(node);

    for &next in adjacency.get(node).into_iter().flatten() {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = find_cycle(next, adjacency, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Done);
    None
}
