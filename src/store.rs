//! Diagram state store: the client's current `(nodes, edges)` snapshot.
//!
//! The store holds no network or allocation logic. Every mutation bumps
//! `revision` so the runtime can republish the view only when something
//! actually changed.

use crate::model::{Edge, Node, Snapshot};

#[derive(Debug, Default)]
pub struct DiagramStore {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    revision: u64,
}

impl DiagramStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self { nodes: snapshot.nodes, edges: snapshot.edges, revision: 0 }
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    #[must_use]
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot { nodes: self.nodes.clone(), edges: self.edges.clone() }
    }

    pub fn set_nodes(&mut self, nodes: Vec<Node>) {
        self.nodes = nodes;
        self.revision += 1;
    }

    pub fn set_edges(&mut self, edges: Vec<Edge>) {
        self.edges = edges;
        self.revision += 1;
    }

    pub fn replace(&mut self, snapshot: Snapshot) {
        self.nodes = snapshot.nodes;
        self.edges = snapshot.edges;
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassData, EdgeData, Position};

    #[test]
    fn every_setter_bumps_revision() {
        let mut store = DiagramStore::new();
        assert_eq!(store.revision(), 0);

        store.set_nodes(vec![Node::class("a", Position::default(), ClassData::named("A"))]);
        store.set_edges(Vec::new());
        store.replace(Snapshot::default());
        assert_eq!(store.revision(), 3);
        assert!(store.nodes().is_empty());
    }

    #[test]
    fn lookups_find_elements_by_id() {
        let store = DiagramStore::from_snapshot(Snapshot {
            nodes: vec![Node::class("a", Position::default(), ClassData::named("A"))],
            edges: vec![Edge::new("e1", "a", "a", EdgeData::default())],
        });
        assert!(store.node("a").is_some());
        assert!(store.edge("e1").is_some());
        assert!(store.node("missing").is_none());
        assert_eq!(store.snapshot().nodes.len(), 1);
    }
}
