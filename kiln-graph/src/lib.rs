//! Generic directed graph library for build action ordering.
//!
//! This crate provides a generic DAG implementation used by the build core for:
//! - Action dependency graphs (compile, link and custom actions)
//! - Prerequisite gathering for a requested set of outputs
//! - Cost estimation by counting dependents
//!
//! # Features
//!
//! - Generic nodes and edges with type parameters
//! - Topological sorting using Kahn's algorithm
//! - Cycle detection, reporting every node stuck behind a cycle
//! - Dependency and dependent tracking, direct and transitive
//! - Optional serde support
//!
//! # Example
//!
//! ```
//! use kiln_graph::{DAG, NodeId};
//!
//! // Create a DAG with string nodes and unit edges
//! let mut dag = DAG::<String, ()>::new();
//!
//! let compile = dag.add_node("compile".to_string());
//! let link = dag.add_node("link".to_string());
//!
//! // link consumes what compile produces
//! dag.add_edge(compile, link, ()).unwrap();
//!
//! let order = dag.topological_sort().unwrap();
//! assert_eq!(order, vec![compile, link]);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node identifier in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(usize);

impl NodeId {
    /// Insertion index of the node.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Id of the node that was inserted `index`-th.
    ///
    /// Lets callers that add nodes in lockstep with their own indices avoid
    /// keeping a separate id table.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Error types for DAG operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Cycle detected in the graph
    #[error("Cycle detected in graph: {0}")]
    CycleDetected(String),

    /// Node not found
    #[error("Node {0} not found in graph")]
    NodeNotFound(NodeId),
}

/// Result type for DAG operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// A node in the DAG containing data and tracking its edges.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Node<N> {
    data: N,
    // Outgoing edges (this node -> nodes that depend on it)
    outgoing: BTreeSet<NodeId>,
    // Incoming edges (nodes this node depends on)
    incoming: BTreeSet<NodeId>,
}

/// An edge in the DAG connecting two nodes with optional data.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Edge<E> {
    from: NodeId,
    to: NodeId,
    data: E,
}

/// Generic directed acyclic graph (DAG).
///
/// Edges express precedence: an edge `a -> b` means `a` must finish before
/// `b` starts. Neighbour sets are ordered, so every traversal below visits
/// nodes in insertion order and results are deterministic.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DAG<N, E> {
    nodes: Vec<Node<N>>,
    edges: Vec<Edge<E>>,
}

impl<N, E> Default for DAG<N, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N, E> DAG<N, E> {
    /// Create a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node to the graph and return its ID.
    pub fn add_node(&mut self, data: N) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            outgoing: BTreeSet::new(),
            incoming: BTreeSet::new(),
        });
        id
    }

    /// Add a directed edge from `from` to `to` with associated data.
    ///
    /// The edge represents precedence: `from` must be processed before `to`.
    ///
    /// # Errors
    ///
    /// - `GraphError::NodeNotFound` if either node doesn't exist
    /// - `GraphError::CycleDetected` if adding the edge would create a cycle
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, data: E) -> GraphResult<()> {
        self.check_node(from)?;
        self.check_node(to)?;

        if self.can_reach(to, from) {
            return Err(GraphError::CycleDetected(format!(
                "Adding edge {from} -> {to} would create a cycle"
            )));
        }

        self.insert_edge(from, to, data);
        Ok(())
    }

    /// Add a directed edge without the reachability check.
    ///
    /// Used when edges are derived in bulk (e.g. from produced/consumed
    /// files) and cycles are reported afterwards with
    /// [`DAG::unorderable_nodes`].
    /// Duplicate edges are ignored.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if either node doesn't exist.
    pub fn link(&mut self, from: NodeId, to: NodeId, data: E) -> GraphResult<()> {
        self.check_node(from)?;
        self.check_node(to)?;
        if !self.nodes[from.0].outgoing.contains(&to) {
            self.insert_edge(from, to, data);
        }
        Ok(())
    }

    fn insert_edge(&mut self, from: NodeId, to: NodeId, data: E) {
        self.edges.push(Edge { from, to, data });
        let _ = self.nodes[from.0].outgoing.insert(to);
        let _ = self.nodes[to.0].incoming.insert(from);
    }

    fn check_node(&self, id: NodeId) -> GraphResult<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::NodeNotFound(id))
        }
    }

    /// Check if there's a path from `start` to `end`.
    fn can_reach(&self, start: NodeId, end: NodeId) -> bool {
        if start == end {
            return true;
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if current == end {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for &neighbor in &self.nodes[current.0].outgoing {
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        false
    }

    /// Get a reference to a node's data.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn node(&self, id: NodeId) -> GraphResult<&N> {
        self.nodes
            .get(id.0)
            .map(|node| &node.data)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Get all node IDs in insertion order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len()).map(NodeId).collect()
    }

    /// Get the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Data attached to the edge `from -> to`, if any.
    #[must_use]
    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<&E> {
        self.edges
            .iter()
            .find(|edge| edge.from == from && edge.to == to)
            .map(|edge| &edge.data)
    }

    /// Get all direct dependencies (incoming edges) of a node.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependencies(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.nodes
            .get(id.0)
            .map(|node| node.incoming.iter().copied().collect())
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Get all direct dependents (outgoing edges) of a node.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependents(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.nodes
            .get(id.0)
            .map(|node| node.outgoing.iter().copied().collect())
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// All nodes `id` transitively depends on, excluding `id` itself.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn ancestors(&self, id: NodeId) -> GraphResult<BTreeSet<NodeId>> {
        self.check_node(id)?;
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].incoming.iter().copied().collect();
        while let Some(current) = stack.pop() {
            if current != id && seen.insert(current) {
                stack.extend(self.nodes[current.0].incoming.iter().copied());
            }
        }
        Ok(seen)
    }

    /// Number of distinct nodes reachable through outgoing edges in at most
    /// `max_depth` hops.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependents_within(&self, id: NodeId, max_depth: usize) -> GraphResult<usize> {
        self.check_node(id)?;
        let mut seen = HashSet::new();
        let mut frontier = vec![id];
        for _ in 0..max_depth {
            let mut next = Vec::new();
            for node in frontier {
                for &dependent in &self.nodes[node.0].outgoing {
                    if dependent != id && seen.insert(dependent) {
                        next.push(dependent);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(seen.len())
    }

    /// Perform topological sort using Kahn's algorithm.
    ///
    /// Returns nodes in dependency order (dependencies before dependents).
    /// Ties are broken by insertion order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` if the graph contains a cycle.
    pub fn topological_sort(&self) -> GraphResult<Vec<NodeId>> {
        let order = self.kahn_order();
        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(GraphError::CycleDetected(format!(
                "{} node(s) could not be ordered",
                self.nodes.len() - order.len()
            )))
        }
    }

    /// Nodes that are part of, or only reachable through, a cycle.
    ///
    /// This is the set left over after repeatedly removing nodes whose
    /// dependencies have all been removed. Empty for an acyclic graph.
    #[must_use]
    pub fn unorderable_nodes(&self) -> Vec<NodeId> {
        let ordered: HashSet<NodeId> = self.kahn_order().into_iter().collect();
        self.node_ids()
            .into_iter()
            .filter(|id| !ordered.contains(id))
            .collect()
    }

    /// Kahn's algorithm; stops early when only cyclic nodes remain.
    fn kahn_order(&self) -> Vec<NodeId> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.incoming.len()).collect();

        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(index, _)| NodeId(index))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);
            for &neighbor in &self.nodes[node_id.0].outgoing {
                let degree = &mut in_degree[neighbor.0];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_empty_dag() {
        let dag = DAG::<String, ()>::new();
        assert_eq!(dag.node_count(), 0);
        assert_eq!(dag.edge_count(), 0);
        assert!(dag.topological_sort().unwrap().is_empty());
    }

    #[test]
    fn test_add_nodes() {
        let mut dag = DAG::<String, ()>::new();
        let a = dag.add_node("a".to_string());
        let b = dag.add_node("b".to_string());

        assert_eq!(dag.node_count(), 2);
        assert_eq!(dag.node(a).unwrap(), "a");
        assert_eq!(dag.node(b).unwrap(), "b");
        assert_eq!(b.index(), 1);
    }

    #[test]
    fn test_cycle_rejected_by_add_edge() {
        let mut dag = DAG::<String, ()>::new();
        let a = dag.add_node("a".to_string());
        let b = dag.add_node("b".to_string());
        let c = dag.add_node("c".to_string());

        dag.add_edge(a, b, ()).unwrap();
        dag.add_edge(b, c, ()).unwrap();

        let result = dag.add_edge(c, a, ());
        assert!(matches!(result, Err(GraphError::CycleDetected(_))));
        assert_eq!(dag.edge_count(), 2);
    }

    #[test]
    fn test_link_allows_cycle_and_reports_it() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");
        let d = dag.add_node("d");

        dag.link(a, b, ()).unwrap();
        dag.link(b, a, ()).unwrap();
        dag.link(b, c, ()).unwrap();
        dag.link(d, a, ()).unwrap();

        assert!(matches!(dag.topological_sort(), Err(GraphError::CycleDetected(_))));

        // c sits behind the cycle, d is ordered before it
        let stuck = dag.unorderable_nodes();
        assert_eq!(stuck, vec![a, b, c]);
    }

    #[test]
    fn test_link_ignores_duplicates() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        dag.link(a, b, ()).unwrap();
        dag.link(a, b, ()).unwrap();
        assert_eq!(dag.edge_count(), 1);
    }

    #[test]
    fn test_missing_node() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let ghost = NodeId(7);
        assert!(matches!(dag.add_edge(a, ghost, ()), Err(GraphError::NodeNotFound(_))));
        assert!(dag.node(ghost).is_err());
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");

        dag.add_edge(a, c, ()).unwrap();
        dag.add_edge(b, c, ()).unwrap();

        assert_eq!(dag.dependencies(c).unwrap(), vec![a, b]);
        assert_eq!(dag.dependents(a).unwrap(), vec![c]);
    }

    #[test]
    fn test_ancestors() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");
        let unrelated = dag.add_node("x");

        dag.add_edge(a, b, ()).unwrap();
        dag.add_edge(b, c, ()).unwrap();

        let ancestors: Vec<_> = dag.ancestors(c).unwrap().into_iter().collect();
        assert_eq!(ancestors, vec![a, b]);
        assert!(dag.ancestors(unrelated).unwrap().is_empty());
    }

    #[test]
    fn test_dependents_within_depth() {
        // chain a -> b -> c -> d -> e
        let mut dag = DAG::<usize, ()>::new();
        let ids: Vec<_> = (0..5).map(|i| dag.add_node(i)).collect();
        for pair in ids.windows(2) {
            dag.add_edge(pair[0], pair[1], ()).unwrap();
        }

        assert_eq!(dag.dependents_within(ids[0], 1).unwrap(), 1);
        assert_eq!(dag.dependents_within(ids[0], 2).unwrap(), 2);
        assert_eq!(dag.dependents_within(ids[0], 10).unwrap(), 4);
        assert_eq!(dag.dependents_within(ids[4], 10).unwrap(), 0);
    }

    #[test]
    fn test_topological_sort_is_stable() {
        let mut dag = DAG::<&str, &str>::new();

        // root -> {a, b} -> c -> d
        let root = dag.add_node("root");
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");
        let d = dag.add_node("d");

        dag.add_edge(root, a, "produces").unwrap();
        dag.add_edge(root, b, "produces").unwrap();
        dag.add_edge(a, c, "produces").unwrap();
        dag.add_edge(b, c, "produces").unwrap();
        dag.add_edge(c, d, "produces").unwrap();

        let order = dag.topological_sort().unwrap();
        assert_eq!(order, vec![root, a, b, c, d]);
        assert_eq!(dag.edge(a, c), Some(&"produces"));
        assert_eq!(dag.edge(c, a), None);
    }
}
