//! Change emitter: local edits applied optimistically, then sent.
//!
//! DESIGN
//! ======
//! Every method updates the store first and then submits the matching
//! outbound frame through the session channel, which either writes it or
//! queues it until the room is joined. Structural changes re-send the whole
//! affected collection; data edits send only `{id, data}`.
//!
//! Nothing here waits on the network. `save_state` registers a waiter and
//! the runtime bounds how long the caller waits for it.

use std::collections::HashSet;

use frames::Frame;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::SessionEvent;
use crate::model::{
    ClassData, Edge, EdgeData, Node, NodeData, Position, RelationKind, Snapshot, generate_id, merge_patch,
};
use crate::net::events::{self, ChangeKind};
use crate::ports::{Endpoint, HandleAllocator};
use crate::reconcile;
use crate::session::DiagramSession;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("unknown edge: {0}")]
    UnknownEdge(String),
    #[error("invalid data patch: {0}")]
    InvalidPatch(#[from] serde_json::Error),
    #[error("session closed")]
    SessionClosed,
}

/// Node-level change reported by the editor.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeChange {
    Position { id: String, position: Position },
    Remove { id: String },
    Add(Node),
    Replace(Node),
}

/// Edge-level change reported by the editor.
#[derive(Clone, Debug, PartialEq)]
pub enum EdgeChange {
    Select { id: String, selected: bool },
    Remove { id: String },
    Add(Edge),
    Replace(Edge),
}

/// What kind of node `add_node` creates.
#[derive(Clone, Debug, PartialEq)]
pub enum NewNode {
    Class(ClassData),
    Note(String),
}

/// A user-drawn connection between two nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    /// `"start:end"`, or a single label for the target end.
    pub cardinality: Option<String>,
}

impl DiagramSession {
    // =========================================================================
    // STRUCTURAL CHANGES
    // =========================================================================

    /// Apply editor node changes and broadcast the full node array.
    pub fn on_nodes_change(&mut self, changes: Vec<NodeChange>) {
        if changes.is_empty() {
            return;
        }
        let mut nodes = self.store.nodes().to_vec();
        let mut removed = HashSet::new();
        for change in changes {
            match change {
                NodeChange::Position { id, position } => {
                    if let Some(node) = nodes.iter_mut().find(|n| n.id == id) {
                        node.position = position;
                    }
                }
                NodeChange::Remove { id } => {
                    nodes.retain(|n| n.id != id);
                    removed.insert(id);
                }
                NodeChange::Add(node) | NodeChange::Replace(node) => upsert(&mut nodes, node, |n| &n.id),
            }
        }
        self.store.set_nodes(nodes);
        self.emit_collection(ChangeKind::Nodes);

        if !removed.is_empty() {
            let before = self.store.edges().len();
            let edges: Vec<Edge> = self
                .store
                .edges()
                .iter()
                .filter(|e| !removed.contains(&e.source) && !removed.contains(&e.target))
                .cloned()
                .collect();
            if edges.len() != before {
                self.store.set_edges(edges);
                self.emit_collection(ChangeKind::Edges);
            }
        }
        self.state_changed();
    }

    /// Apply editor edge changes. Selection-only batches stay local.
    pub fn on_edges_change(&mut self, changes: Vec<EdgeChange>) {
        if changes.is_empty() {
            return;
        }
        let selection_only = changes.iter().all(|c| matches!(c, EdgeChange::Select { .. }));
        let mut edges = self.store.edges().to_vec();
        for change in changes {
            match change {
                EdgeChange::Select { id, selected } => {
                    if let Some(edge) = edges.iter_mut().find(|e| e.id == id) {
                        edge.data.selected = Some(selected);
                    }
                }
                EdgeChange::Remove { id } => edges.retain(|e| e.id != id),
                EdgeChange::Add(edge) | EdgeChange::Replace(edge) => upsert(&mut edges, edge, |e| &e.id),
            }
        }
        self.store.set_edges(edges);

        if selection_only {
            let selected = self
                .store
                .edges()
                .iter()
                .filter(|e| e.data.selected == Some(true))
                .map(|e| e.id.clone())
                .collect();
            self.bus.publish(SessionEvent::EdgeSelectionChanged { selected });
        } else {
            self.emit_collection(ChangeKind::Edges);
        }
        self.state_changed();
    }

    /// Create a relation between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnknownNode`] when either endpoint is missing.
    pub fn connect(&mut self, request: ConnectRequest) -> Result<String, EmitError> {
        for id in [&request.source, &request.target] {
            if self.store.node(id).is_none() {
                return Err(EmitError::UnknownNode(id.clone()));
            }
        }

        let mut data = EdgeData::of_kind(request.kind);
        if let Some(cardinality) = request.cardinality.as_deref() {
            data = data.with_cardinality(cardinality);
        }
        data.local_created = Some(true);

        let nodes = self.store.nodes();
        let mut allocator = HandleAllocator::seeded(self.store.edges());
        let pair = allocator.allocate(
            Endpoint::lookup(&request.source, nodes),
            Endpoint::lookup(&request.target, nodes),
        );

        let mut edge = Edge::new(generate_id("edge"), request.source, request.target, data);
        edge.source_handle = Some(pair.source);
        edge.target_handle = Some(pair.target);
        let id = edge.id.clone();
        info!(edge_id = %id, source = %edge.source, target = %edge.target, "edge created");

        let mut edges = self.store.edges().to_vec();
        edges.push(edge);
        self.store.set_edges(edges);
        self.emit_collection(ChangeKind::Edges);
        self.state_changed();
        Ok(id)
    }

    /// Delete nodes and edges by id. Edges attached to deleted nodes go too.
    pub fn delete_elements(&mut self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let set: HashSet<String> = ids.iter().cloned().collect();
        reconcile::remove_elements(&self.store, &set).commit(&mut self.store);
        self.send(events::element_operation(self.room_id(), &self.identity, "delete", json!(ids)));
        self.state_changed();
    }

    // =========================================================================
    // SINGLE ELEMENTS
    // =========================================================================

    /// Append a new node with a generated id and return the id.
    pub fn add_node(&mut self, node: NewNode, position: Position) -> String {
        let id = generate_id("node");
        let node = match node {
            NewNode::Class(data) => Node::class(id.clone(), position, data),
            NewNode::Note(text) => Node::note(id.clone(), position, text),
        };
        let element = serde_json::to_value(&node);

        let mut nodes = self.store.nodes().to_vec();
        nodes.push(node);
        self.store.set_nodes(nodes);
        match element {
            Ok(element) => self.emit_change(ChangeKind::AddNode, element),
            Err(e) => warn!(error = %e, node_id = %id, "node not serializable; addition kept local"),
        }
        self.state_changed();
        id
    }

    /// Shallow-merge `patch` into a node's data and send `{id, data}`.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError`] when the node is unknown or the patched data is
    /// no longer valid node data.
    pub fn update_node_data(&mut self, id: &str, patch: &Value) -> Result<(), EmitError> {
        let node = self.store.node(id).ok_or_else(|| EmitError::UnknownNode(id.to_owned()))?;
        let data: NodeData = merge_patch(&node.data, patch)?;
        let element = json!({"id": id, "data": data});

        let nodes = self
            .store
            .nodes()
            .iter()
            .map(|n| if n.id == id { Node { data: data.clone(), ..n.clone() } } else { n.clone() })
            .collect();
        self.store.set_nodes(nodes);
        self.emit_change(ChangeKind::UpdateNode, element);
        self.state_changed();
        Ok(())
    }

    /// Shallow-merge `patch` into an edge's data and send `{id, data}`.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError`] when the edge is unknown or the patch does not
    /// fit edge data.
    pub fn update_edge_data(&mut self, id: &str, patch: &Value) -> Result<(), EmitError> {
        let edge = self.store.edge(id).ok_or_else(|| EmitError::UnknownEdge(id.to_owned()))?;
        let mut data: EdgeData = merge_patch(&edge.data, patch)?;
        data.local_created = edge.data.local_created;
        let element = json!({"id": id, "data": data});

        let edges = self
            .store
            .edges()
            .iter()
            .map(|e| if e.id == id { Edge { data: data.clone(), ..e.clone() } } else { e.clone() })
            .collect();
        self.store.set_edges(edges);
        self.emit_change(ChangeKind::UpdateNode, element);
        self.state_changed();
        Ok(())
    }

    /// Turn a relation into one with an association class: a class node at
    /// the relation midpoint plus a connector edge back to the relation.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnknownEdge`] when the relation does not exist.
    pub fn attach_association_class(&mut self, edge_id: &str, class_name: &str) -> Result<String, EmitError> {
        let relation = self.store.edge(edge_id).cloned().ok_or_else(|| EmitError::UnknownEdge(edge_id.to_owned()))?;
        let source = self.store.node(&relation.source).map(|n| n.position);
        let target = self.store.node(&relation.target).map(|n| n.position);
        let position = match (source, target) {
            (Some(a), Some(b)) => a.midpoint(b),
            (a, b) => a.or(b).unwrap_or_default(),
        };

        let mut class = ClassData::named(class_name);
        class.is_association_class = Some(true);
        class.associated_edge_id = Some(relation.id.clone());
        let node = Node::class(generate_id("node"), position, class);
        let node_id = node.id.clone();

        let mut connector_data = EdgeData::of_kind(RelationKind::Association);
        connector_data.is_association_connection = Some(true);
        connector_data.parent_relation_id = Some(relation.id.clone());
        connector_data.local_created = Some(true);

        let mut nodes = self.store.nodes().to_vec();
        nodes.push(node);
        let mut allocator = HandleAllocator::seeded(self.store.edges());
        let pair = allocator.allocate(
            Endpoint::lookup(&node_id, &nodes),
            Endpoint::lookup(&relation.source, &nodes),
        );
        let mut connector = Edge::new(generate_id("edge"), node_id.clone(), relation.source.clone(), connector_data);
        connector.source_handle = Some(pair.source);
        connector.target_handle = Some(pair.target);

        let mut edges: Vec<Edge> = self
            .store
            .edges()
            .iter()
            .map(|e| {
                let mut e = e.clone();
                if e.id == relation.id {
                    e.data.has_association_class = Some(true);
                }
                e
            })
            .collect();
        edges.push(connector);

        self.store.set_nodes(nodes);
        self.store.set_edges(edges);
        self.emit_collection(ChangeKind::Nodes);
        self.emit_collection(ChangeKind::Edges);
        self.state_changed();
        info!(%edge_id, %node_id, "association class attached");
        Ok(node_id)
    }

    // =========================================================================
    // WHOLE DIAGRAM
    // =========================================================================

    /// Replace the whole diagram, broadcast it, and persist it once the
    /// settle delay has passed. Duplicate and dangling edges are dropped
    /// before anything is stored or sent.
    pub fn update_board_data(&mut self, snapshot: Snapshot) {
        let report = reconcile::normalize(snapshot).commit(&mut self.store);
        if report.deduplicated + report.dangling_dropped > 0 {
            debug!(
                deduplicated = report.deduplicated,
                dangling_dropped = report.dangling_dropped,
                "board replacement cleaned up"
            );
        }
        let state = self.store.snapshot();
        self.send(events::update_diagram(self.room_id(), &self.identity, &state));
        self.persist_at = Some(Instant::now() + self.config.settle_delay);
        self.state_changed();
    }

    pub fn request_state(&mut self) {
        self.send(events::request_state(self.room_id()));
    }

    /// Send the current snapshot as a `saveState`.
    pub(crate) fn persist(&mut self) {
        let state = self.store.snapshot();
        debug!(nodes = state.nodes.len(), edges = state.edges.len(), "persisting diagram");
        self.send(events::save_state(self.room_id(), &state));
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn emit_collection(&mut self, kind: ChangeKind) {
        let elements = match kind {
            ChangeKind::Edges => serde_json::to_value(self.store.edges()),
            _ => serde_json::to_value(self.store.nodes()),
        };
        match elements {
            Ok(elements) => self.emit_change(kind, elements),
            Err(e) => warn!(error = %e, tipo = kind.as_str(), "collection not serializable; change kept local"),
        }
    }

    fn emit_change(&mut self, kind: ChangeKind, elemento: Value) {
        let frame = events::instant_change(self.room_id(), &self.identity, kind, elemento);
        self.send(frame);
    }

    fn send(&mut self, frame: Frame) {
        if let Some(dropped) = self.channel.submit(frame) {
            self.bus.publish(SessionEvent::QueueOverflow { dropped_event: dropped.event });
        }
    }

    fn state_changed(&self) {
        self.bus.publish(SessionEvent::StateChanged { revision: self.store.revision() });
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(i) => items[i] = item,
        None => items.push(item),
    }
}

#[cfg(test)]
#[path = "emitter_test.rs"]
mod tests;
