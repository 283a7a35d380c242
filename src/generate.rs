//! Import of AI-generated diagrams.
//!
//! DESIGN
//! ======
//! The diagram service answers with either a complete `newState` or a list of
//! `elements` and `relationships`. A `newState` replaces the board once it has been normalized.
//! Elements are matched to existing classes by name (members are unioned,
//! positions kept); the rest are laid out on a three-column grid to the right
//! of the current diagram. Relationships resolve their endpoints by element
//! id, then class name, then raw node id; a relationship between nodes that
//! are already linked keeps the existing edge. The result goes through the
//! normal partial merge and is published like any full-board update.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{
    ClassData, Edge, EdgeData, Node, NodeData, Position, RelationKind, Snapshot, generate_id,
};
use crate::ports::{Endpoint, HandleAllocator};
use crate::reconcile;
use crate::session::DiagramSession;
use crate::store::DiagramStore;

const GRID_COLUMNS: usize = 3;
const GRID_DX: f64 = 300.0;
const GRID_DY: f64 = 250.0;

/// Response of the diagram generation service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub diagram: Option<GeneratedDiagram>,
    #[serde(default)]
    pub new_state: Option<Snapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDiagram {
    #[serde(default)]
    pub elements: Vec<GeneratedElement>,
    #[serde(default)]
    pub relationships: Vec<GeneratedRelationship>,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedElement {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(alias = "name", default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl GeneratedElement {
    fn is_note(&self) -> bool {
        self.kind.as_deref().is_some_and(|k| k.eq_ignore_ascii_case("note"))
            || (self.class_name.is_none() && self.text.is_some())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRelationship {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(rename = "type", default)]
    pub kind: RelationKind,
    #[serde(default)]
    pub cardinality: Option<String>,
}

/// What an import did, handed back to the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub edges_added: usize,
    /// Relationships whose endpoints could not be resolved.
    pub skipped: Vec<String>,
    pub clarifying_questions: Vec<String>,
}

impl ImportOutcome {
    fn failed(message: Option<String>, error: impl Into<String>) -> Self {
        Self { success: false, message, error: Some(error.into()), ..Self::default() }
    }
}

/// Nodes and edges an import will merge.
#[derive(Debug, Default)]
pub struct ImportPlan {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub nodes_added: usize,
    pub nodes_updated: usize,
    /// Relationships between nodes that were already linked.
    pub existing: usize,
    pub skipped: Vec<String>,
}

// =============================================================================
// PLANNING
// =============================================================================

/// Turn generated elements and relationships into nodes and edges against
/// the current diagram. Pure: the store is only read.
#[must_use]
pub fn plan_import(current: &Snapshot, diagram: &GeneratedDiagram) -> ImportPlan {
    let mut plan = ImportPlan::default();
    let mut by_name: HashMap<String, String> = current
        .nodes
        .iter()
        .filter_map(|n| n.data.class_name().map(|name| (name.to_lowercase(), n.id.clone())))
        .collect();
    let mut by_element: HashMap<String, String> = HashMap::new();
    let mut grid = Grid::right_of(&current.nodes);

    for element in &diagram.elements {
        if element.is_note() {
            let position = element.position.unwrap_or_else(|| grid.place());
            let node = Node::note(generate_id("node"), position, element.text.clone().unwrap_or_default());
            remember(&mut by_element, element.id.as_deref(), &node.id);
            plan.nodes.push(node);
            plan.nodes_added += 1;
            continue;
        }

        let Some(name) = element.class_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            warn!(element_id = ?element.id, "generated element without class name skipped");
            continue;
        };

        let existing = by_name.get(&name.to_lowercase()).and_then(|id| {
            plan.nodes.iter().find(|n| &n.id == id).or_else(|| current.nodes.iter().find(|n| &n.id == id))
        });

        let node = if let Some(existing) = existing {
            let mut node = existing.clone();
            if let NodeData::Class(data) = &mut node.data {
                union_into(&mut data.attributes, &element.attributes);
                union_into(&mut data.methods, &element.methods);
            }
            plan.nodes_updated += 1;
            node
        } else {
            let mut data = ClassData::named(name);
            data.attributes.clone_from(&element.attributes);
            data.methods.clone_from(&element.methods);
            let position = element.position.unwrap_or_else(|| grid.place());
            plan.nodes_added += 1;
            Node::class(generate_id("node"), position, data)
        };

        by_name.insert(name.to_lowercase(), node.id.clone());
        remember(&mut by_element, element.id.as_deref(), &node.id);
        upsert_node(&mut plan.nodes, node);
    }

    let all_nodes: Vec<Node> = merged_nodes(&current.nodes, &plan.nodes);
    let resolve = |key: &str| -> Option<String> {
        by_element
            .get(key)
            .or_else(|| by_name.get(&key.to_lowercase()))
            .cloned()
            .or_else(|| all_nodes.iter().find(|n| n.id == key).map(|n| n.id.clone()))
    };

    let mut linked: HashSet<String> = current
        .edges
        .iter()
        .filter(|e| !e.is_system_connector())
        .map(Edge::endpoint_key)
        .collect();
    let mut allocator = HandleAllocator::seeded(&current.edges);
    for rel in &diagram.relationships {
        let (Some(source), Some(target)) = (resolve(&rel.source), resolve(&rel.target)) else {
            warn!(source = %rel.source, target = %rel.target, "relationship endpoint not found; skipped");
            plan.skipped.push(format!("{} -> {}", rel.source, rel.target));
            continue;
        };

        let mut data = EdgeData::of_kind(rel.kind);
        if let Some(cardinality) = rel.cardinality.as_deref() {
            data = data.with_cardinality(cardinality);
        }
        data.local_created = Some(true);

        let mut edge = Edge::new(generate_id("edge"), source, target, data);
        if !edge.is_system_connector() && !linked.insert(edge.endpoint_key()) {
            debug!(source = %edge.source, target = %edge.target, "relationship already on the board; kept existing edge");
            plan.existing += 1;
            continue;
        }

        let pair =
            allocator.allocate(Endpoint::lookup(&edge.source, &all_nodes), Endpoint::lookup(&edge.target, &all_nodes));
        edge.source_handle = Some(pair.source);
        edge.target_handle = Some(pair.target);
        plan.edges.push(edge);
    }

    plan
}

/// Give handles to edges that arrived without them.
pub fn fill_missing_handles(snapshot: &mut Snapshot) {
    let mut allocator = HandleAllocator::seeded(&snapshot.edges);
    for edge in &mut snapshot.edges {
        if edge.source_handle.is_some() && edge.target_handle.is_some() {
            continue;
        }
        let pair = allocator.allocate(
            Endpoint::lookup(&edge.source, &snapshot.nodes),
            Endpoint::lookup(&edge.target, &snapshot.nodes),
        );
        edge.source_handle.get_or_insert(pair.source);
        edge.target_handle.get_or_insert(pair.target);
    }
}

fn remember(map: &mut HashMap<String, String>, element_id: Option<&str>, node_id: &str) {
    if let Some(element_id) = element_id {
        map.insert(element_id.to_owned(), node_id.to_owned());
    }
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn upsert_node(nodes: &mut Vec<Node>, node: Node) {
    match nodes.iter_mut().find(|n| n.id == node.id) {
        Some(slot) => *slot = node,
        None => nodes.push(node),
    }
}

fn merged_nodes(current: &[Node], planned: &[Node]) -> Vec<Node> {
    let mut all = current.to_vec();
    for node in planned {
        upsert_node(&mut all, node.clone());
    }
    all
}

/// Grid cursor for elements without a position.
struct Grid {
    origin: Position,
    next_slot: usize,
}

impl Grid {
    fn right_of(nodes: &[Node]) -> Self {
        let origin = if nodes.is_empty() {
            Position::default()
        } else {
            let max_x = nodes.iter().map(|n| n.position.x).fold(f64::MIN, f64::max);
            let min_y = nodes.iter().map(|n| n.position.y).fold(f64::MAX, f64::min);
            Position::new(max_x + GRID_DX, min_y)
        };
        Self { origin, next_slot: 0 }
    }

    #[allow(clippy::cast_precision_loss)]
    fn place(&mut self) -> Position {
        let col = self.next_slot % GRID_COLUMNS;
        let row = self.next_slot / GRID_COLUMNS;
        self.next_slot += 1;
        Position::new(self.origin.x + col as f64 * GRID_DX, self.origin.y + row as f64 * GRID_DY)
    }
}

// =============================================================================
// SESSION ENTRY POINT
// =============================================================================

impl DiagramSession {
    /// Merge a generation result into the board and publish it.
    pub fn apply_generated(&mut self, result: GenerationResult) -> ImportOutcome {
        if !result.success {
            let error = result.error.unwrap_or_else(|| "generation failed".to_owned());
            warn!(%error, "generation result rejected");
            return ImportOutcome::failed(result.message, error);
        }

        if let Some(mut state) = result.new_state {
            fill_missing_handles(&mut state);
            self.update_board_data(state);
            let (nodes, edges) = (self.store.nodes().len(), self.store.edges().len());
            info!(nodes, edges, "generated state replaces board");
            return ImportOutcome {
                success: true,
                message: result.message,
                nodes_added: nodes,
                edges_added: edges,
                ..ImportOutcome::default()
            };
        }

        let Some(diagram) = result.diagram else {
            return ImportOutcome::failed(result.message, "result carries neither diagram nor newState");
        };

        let plan = plan_import(&self.store.snapshot(), &diagram);
        let edges_added = plan.edges.len();
        let mut scratch = DiagramStore::from_snapshot(self.store.snapshot());
        reconcile::merge_partial_nodes(&scratch, plan.nodes).commit(&mut scratch);
        reconcile::merge_partial_edges(&scratch, plan.edges).commit(&mut scratch);
        info!(
            nodes_added = plan.nodes_added,
            nodes_updated = plan.nodes_updated,
            edges_added,
            existing = plan.existing,
            skipped = plan.skipped.len(),
            "generated diagram merged"
        );
        self.update_board_data(scratch.snapshot());

        ImportOutcome {
            success: true,
            message: result.message,
            error: None,
            nodes_added: plan.nodes_added,
            nodes_updated: plan.nodes_updated,
            edges_added,
            skipped: plan.skipped,
            clarifying_questions: diagram.clarifying_questions,
        }
    }
}

#[cfg(test)]
#[path = "generate_test.rs"]
mod tests;
