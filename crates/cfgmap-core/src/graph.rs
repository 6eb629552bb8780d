//! Property Graph
//!
//! Undirected adjacency between node entries, built on petgraph's
//! `StableGraph` so vertex and edge indices survive removals.
//!
//! Vertices and edges are views onto table entries: each carries the
//! [`EntryRef`] of the node or link it represents and nothing else. Per-vertex
//! adjacency is kept in a map ordered by edge name (the link key), so
//! iteration order depends only on the set of edges, never on arrival order.

use crate::key::NodeKey;
use crate::table::EntryRef;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::Undirected;
use std::collections::{BTreeMap, HashMap};

/// Vertex weight: the node it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    pub node: NodeKey,
    pub entry: EntryRef,
}

/// Edge weight: the link it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// Link key
    pub name: String,
    pub link: EntryRef,
}

/// Adjacency view of the node and link tables.
#[derive(Debug, Default)]
pub struct PropertyGraph {
    /// The underlying petgraph instance
    graph: StableGraph<Vertex, GraphEdge, Undirected>,

    /// Map from node identity to vertex for O(1) lookup
    by_key: HashMap<NodeKey, NodeIndex>,

    /// Name-ordered adjacency per vertex
    adjacency: HashMap<NodeIndex, BTreeMap<String, EdgeIndex>>,

    /// Bumped on every structural change
    mutations: u64,
    walks: u64,
}

impl PropertyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Vertex Operations
    // ------------------------------------------------------------------------

    /// Register a vertex for `node`. Re-adding an existing node only
    /// refreshes its entry handle.
    pub fn add_node(&mut self, node: NodeKey, entry: EntryRef) -> NodeIndex {
        if let Some(&idx) = self.by_key.get(&node) {
            if let Some(vertex) = self.graph.node_weight_mut(idx) {
                vertex.entry = entry;
            }
            return idx;
        }
        let idx = self.graph.add_node(Vertex {
            node: node.clone(),
            entry,
        });
        self.by_key.insert(node, idx);
        self.adjacency.insert(idx, BTreeMap::new());
        self.mutations += 1;
        idx
    }

    /// Unregister the vertex for `node`.
    ///
    /// # Panics
    ///
    /// If the vertex still has edges. Callers remove edges first.
    pub fn remove_node(&mut self, node: &NodeKey) -> Option<Vertex> {
        let idx = *self.by_key.get(node)?;
        assert!(
            !self.has_adjacencies(idx),
            "removing vertex {} with live edges",
            node
        );
        self.by_key.remove(node);
        self.adjacency.remove(&idx);
        self.mutations += 1;
        self.graph.remove_node(idx)
    }

    pub fn vertex_of(&self, node: &NodeKey) -> Option<NodeIndex> {
        self.by_key.get(node).copied()
    }

    pub fn vertex(&self, idx: NodeIndex) -> Option<&Vertex> {
        self.graph.node_weight(idx)
    }

    pub fn contains_node(&self, node: &NodeKey) -> bool {
        self.by_key.contains_key(node)
    }

    pub fn has_adjacencies(&self, idx: NodeIndex) -> bool {
        self.adjacency.get(&idx).is_some_and(|edges| !edges.is_empty())
    }

    // ------------------------------------------------------------------------
    // Edge Operations
    // ------------------------------------------------------------------------

    /// Connect `a` and `b` with the edge called `name`.
    ///
    /// A second call with the same name updates the existing edge in place.
    /// Returns `None` if either vertex is unknown.
    pub fn link(
        &mut self,
        a: &NodeKey,
        b: &NodeKey,
        name: &str,
        link: EntryRef,
    ) -> Option<EdgeIndex> {
        let ia = self.vertex_of(a)?;
        let ib = self.vertex_of(b)?;

        if let Some(&edge) = self.adjacency.get(&ia).and_then(|edges| edges.get(name)) {
            if let Some(weight) = self.graph.edge_weight_mut(edge) {
                weight.link = link;
            }
            return Some(edge);
        }

        let edge = self.graph.add_edge(
            ia,
            ib,
            GraphEdge {
                name: name.to_string(),
                link,
            },
        );
        for idx in [ia, ib] {
            self.adjacency
                .entry(idx)
                .or_default()
                .insert(name.to_string(), edge);
        }
        self.mutations += 1;
        Some(edge)
    }

    /// Remove the edge called `name` between `a` and `b`.
    pub fn unlink(&mut self, a: &NodeKey, b: &NodeKey, name: &str) -> Option<GraphEdge> {
        let ia = self.vertex_of(a)?;
        let ib = self.vertex_of(b)?;
        let edge = *self.adjacency.get(&ia)?.get(name)?;
        for idx in [ia, ib] {
            if let Some(edges) = self.adjacency.get_mut(&idx) {
                edges.remove(name);
            }
        }
        self.mutations += 1;
        self.graph.remove_edge(edge)
    }

    /// First edge between `a` and `b` in name order.
    pub fn get_edge(&self, a: &NodeKey, b: &NodeKey) -> Option<&GraphEdge> {
        let ia = self.vertex_of(a)?;
        let ib = self.vertex_of(b)?;
        self.adjacency.get(&ia)?.values().find_map(|&edge| {
            let (x, y) = self.graph.edge_endpoints(edge)?;
            let other = if x == ia { y } else { x };
            (other == ib).then(|| self.graph.edge_weight(edge)).flatten()
        })
    }

    /// Edges of `node` in name order, paired with the opposite vertex's key.
    pub fn edges(&self, node: &NodeKey) -> Vec<(&GraphEdge, &NodeKey)> {
        let Some(idx) = self.vertex_of(node) else {
            return Vec::new();
        };
        let Some(edges) = self.adjacency.get(&idx) else {
            return Vec::new();
        };
        edges
            .values()
            .filter_map(|&edge| {
                let (x, y) = self.graph.edge_endpoints(edge)?;
                let other = if x == idx { y } else { x };
                Some((self.graph.edge_weight(edge)?, &self.graph.node_weight(other)?.node))
            })
            .collect()
    }

    /// Keys of the vertices adjacent to `node`, in edge-name order.
    pub fn neighbors(&self, node: &NodeKey) -> Vec<NodeKey> {
        self.edges(node)
            .into_iter()
            .map(|(_, other)| other.clone())
            .collect()
    }

    pub fn degree(&self, node: &NodeKey) -> usize {
        self.vertex_of(node)
            .and_then(|idx| self.adjacency.get(&idx))
            .map_or(0, BTreeMap::len)
    }

    // ------------------------------------------------------------------------
    // Walks
    // ------------------------------------------------------------------------

    /// Allocate a walk id. Ids increase monotonically.
    pub fn get_walk_number(&mut self) -> u64 {
        self.walks += 1;
        self.walks
    }

    /// Structural change counter; a walker that sees it move restarts.
    pub fn mutation_count(&self) -> u64 {
        self.mutations
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All vertex keys, sorted.
    pub fn node_keys(&self) -> Vec<NodeKey> {
        let mut keys: Vec<_> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// All edge names, sorted.
    pub fn edge_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .graph
            .edge_weights()
            .map(|edge| edge.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.by_key.clear();
        self.adjacency.clear();
        self.mutations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn refs(n: usize) -> Vec<EntryRef> {
        let mut arena = Arena::new();
        (0..n)
            .map(|i| EntryRef {
                partition: 0,
                id: arena.insert(i),
            })
            .collect()
    }

    fn key(name: &str) -> NodeKey {
        NodeKey::new("foo", name)
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let r = refs(2);
        let mut graph = PropertyGraph::new();
        let a = graph.add_node(key("a"), r[0]);
        let again = graph.add_node(key("a"), r[1]);
        assert_eq!(a, again);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.vertex(a).unwrap().entry, r[1]);
    }

    #[test]
    fn test_link_updates_existing_edge() {
        let r = refs(4);
        let mut graph = PropertyGraph::new();
        graph.add_node(key("a"), r[0]);
        graph.add_node(key("b"), r[1]);

        let e1 = graph.link(&key("a"), &key("b"), "x,foo:a,foo:b", r[2]).unwrap();
        let e2 = graph.link(&key("b"), &key("a"), "x,foo:a,foo:b", r[3]).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.get_edge(&key("a"), &key("b")).unwrap().link, r[3]);
    }

    #[test]
    fn test_link_requires_both_vertices() {
        let r = refs(2);
        let mut graph = PropertyGraph::new();
        graph.add_node(key("a"), r[0]);
        assert!(graph.link(&key("a"), &key("missing"), "x", r[1]).is_none());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_edges_in_name_order() {
        let r = refs(8);
        let mut graph = PropertyGraph::new();
        graph.add_node(key("hub"), r[0]);
        graph.add_node(key("c"), r[1]);
        graph.add_node(key("a"), r[2]);
        graph.add_node(key("b"), r[3]);
        graph.link(&key("hub"), &key("c"), "r,c", r[4]);
        graph.link(&key("hub"), &key("a"), "r,a", r[5]);
        graph.link(&key("hub"), &key("b"), "r,b", r[6]);

        assert_eq!(graph.neighbors(&key("hub")), vec![key("a"), key("b"), key("c")]);
        assert_eq!(graph.neighbors(&key("a")), vec![key("hub")]);
        assert_eq!(graph.degree(&key("hub")), 3);
    }

    #[test]
    fn test_unlink_and_remove() {
        let r = refs(3);
        let mut graph = PropertyGraph::new();
        graph.add_node(key("a"), r[0]);
        graph.add_node(key("b"), r[1]);
        graph.link(&key("a"), &key("b"), "e", r[2]);

        assert!(graph.unlink(&key("a"), &key("b"), "e").is_some());
        assert!(graph.get_edge(&key("a"), &key("b")).is_none());
        assert!(graph.unlink(&key("a"), &key("b"), "e").is_none());

        assert!(graph.remove_node(&key("a")).is_some());
        assert!(!graph.contains_node(&key("a")));
        assert_eq!(graph.node_keys(), vec![key("b")]);
    }

    #[test]
    #[should_panic(expected = "live edges")]
    fn test_remove_node_with_edges_panics() {
        let r = refs(3);
        let mut graph = PropertyGraph::new();
        graph.add_node(key("a"), r[0]);
        graph.add_node(key("b"), r[1]);
        graph.link(&key("a"), &key("b"), "e", r[2]);
        graph.remove_node(&key("a"));
    }

    #[test]
    fn test_walk_numbers_and_mutation_count() {
        let r = refs(1);
        let mut graph = PropertyGraph::new();
        let w1 = graph.get_walk_number();
        let w2 = graph.get_walk_number();
        assert!(w2 > w1);

        let before = graph.mutation_count();
        graph.add_node(key("a"), r[0]);
        assert!(graph.mutation_count() > before);
    }
}
