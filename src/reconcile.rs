//! Reconciler: merges incoming node/edge collections into the local store.
//!
//! DESIGN
//! ======
//! Merge functions are pure: they read the store and return a `Merged`
//! value, which the caller commits. The `apply_*` entry points take untyped
//! JSON straight from the wire, parse everything first, and only then
//! commit. A payload that fails to parse returns `ReconcileError` and leaves
//! the store exactly as it was.
//!
//! Edge rules, in order:
//! 1. incoming edges keyed by id (server truth);
//! 2. local `_localCreated` edges the server has not echoed yet are kept;
//! 3. one primary edge per unordered endpoint pair, preferring an incoming
//!    id, otherwise the first seen (system connectors are exempt);
//! 4. edges whose endpoints are not in the node set are dropped.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::model::{Edge, EdgeData, Node, NodeData, Snapshot, merge_patch};
use crate::store::DiagramStore;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed {what} payload: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("expected {0}")]
    Shape(&'static str),
}

impl ReconcileError {
    fn malformed(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Malformed { what, source }
    }
}

/// Counters describing what a merge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub nodes: usize,
    pub edges: usize,
    pub preserved_local: usize,
    pub deduplicated: usize,
    pub dangling_dropped: usize,
}

/// A computed merge result, not yet written to the store.
#[derive(Debug)]
pub struct Merged {
    pub snapshot: Snapshot,
    pub report: MergeReport,
}

impl Merged {
    pub fn commit(self, store: &mut DiagramStore) -> MergeReport {
        let report = self.report;
        debug!(
            nodes = report.nodes,
            edges = report.edges,
            preserved_local = report.preserved_local,
            deduplicated = report.deduplicated,
            dangling_dropped = report.dangling_dropped,
            "merge committed"
        );
        store.replace(self.snapshot);
        report
    }
}

/// Which collection an instant-change array replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Nodes,
    Edges,
}

/// What a single untyped element looks like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementShape {
    /// Carries `position`.
    Node,
    /// Carries `source` and `target`.
    Edge,
    /// Only `{id, data}`.
    Patch,
}

#[must_use]
pub fn detect_shape(element: &Value) -> ElementShape {
    if element.get("position").is_some() {
        ElementShape::Node
    } else if element.get("source").is_some() && element.get("target").is_some() {
        ElementShape::Edge
    } else {
        ElementShape::Patch
    }
}

// =============================================================================
// TYPED MERGES
// =============================================================================

/// Full-snapshot merge: node set becomes the incoming set, edges follow the
/// full edge rules.
#[must_use]
pub fn merge_full(store: &DiagramStore, incoming: Snapshot) -> Merged {
    let mut report = MergeReport::default();
    let nodes = unique_nodes(incoming.nodes);
    let edges = reconcile_edges(store.edges(), incoming.edges, &nodes, &mut report);
    finish(nodes, edges, report)
}

/// A snapshot made valid on its own: unique node ids, one primary edge per
/// endpoint pair, no dangling edges. Used for local whole-board replacements,
/// where nothing in the current store should survive.
#[must_use]
pub fn normalize(incoming: Snapshot) -> Merged {
    let mut report = MergeReport::default();
    let nodes = unique_nodes(incoming.nodes);
    let edges = reconcile_edges(&[], incoming.edges, &nodes, &mut report);
    finish(nodes, edges, report)
}

/// Instant-change node array: replaces the node collection.
#[must_use]
pub fn replace_nodes(store: &DiagramStore, incoming: Vec<Node>) -> Merged {
    let mut report = MergeReport::default();
    let nodes = unique_nodes(incoming);
    let edges = drop_dangling(store.edges().to_vec(), &nodes, &mut report);
    finish(nodes, edges, report)
}

/// Instant-change edge array: full edge rules against the current nodes.
#[must_use]
pub fn replace_edges(store: &DiagramStore, incoming: Vec<Edge>) -> Merged {
    let mut report = MergeReport::default();
    let nodes = store.nodes().to_vec();
    let edges = reconcile_edges(store.edges(), incoming, &nodes, &mut report);
    finish(nodes, edges, report)
}

/// Update nodes by id, append unseen ones.
#[must_use]
pub fn merge_partial_nodes(store: &DiagramStore, incoming: Vec<Node>) -> Merged {
    let mut report = MergeReport::default();
    let nodes = upsert_by_id(store.nodes().to_vec(), incoming, |n| &n.id);
    let edges = drop_dangling(store.edges().to_vec(), &nodes, &mut report);
    finish(nodes, edges, report)
}

/// Update edges by id, append unseen ones, then dedupe and drop dangling.
#[must_use]
pub fn merge_partial_edges(store: &DiagramStore, incoming: Vec<Edge>) -> Merged {
    let mut report = MergeReport::default();
    let authoritative: HashSet<String> = incoming.iter().map(|e| e.id.clone()).collect();
    let merged = upsert_by_id(store.edges().to_vec(), incoming, |e| &e.id);
    let deduped = dedupe_endpoints(merged, &authoritative, &mut report);
    let nodes = store.nodes().to_vec();
    let edges = drop_dangling(deduped, &nodes, &mut report);
    finish(nodes, edges, report)
}

/// Remove nodes and edges by id; edges left dangling go too.
#[must_use]
pub fn remove_elements(store: &DiagramStore, ids: &HashSet<String>) -> Merged {
    let mut report = MergeReport::default();
    let nodes: Vec<Node> = store.nodes().iter().filter(|n| !ids.contains(&n.id)).cloned().collect();
    let edges: Vec<Edge> = store.edges().iter().filter(|e| !ids.contains(&e.id)).cloned().collect();
    let edges = drop_dangling(edges, &nodes, &mut report);
    finish(nodes, edges, report)
}

fn finish(nodes: Vec<Node>, edges: Vec<Edge>, mut report: MergeReport) -> Merged {
    report.nodes = nodes.len();
    report.edges = edges.len();
    Merged { snapshot: Snapshot { nodes, edges }, report }
}

fn unique_nodes(incoming: Vec<Node>) -> Vec<Node> {
    upsert_by_id(Vec::new(), incoming, |n| &n.id)
}

/// Later elements with a known id overwrite in place; unseen ids append.
fn upsert_by_id<T>(mut current: Vec<T>, incoming: Vec<T>, id: impl Fn(&T) -> &String) -> Vec<T> {
    let mut index: HashMap<String, usize> =
        current.iter().enumerate().map(|(i, item)| (id(item).clone(), i)).collect();
    for item in incoming {
        match index.get(id(&item)) {
            Some(&i) => current[i] = item,
            None => {
                index.insert(id(&item).clone(), current.len());
                current.push(item);
            }
        }
    }
    current
}

fn reconcile_edges(
    local: &[Edge],
    incoming: Vec<Edge>,
    nodes: &[Node],
    report: &mut MergeReport,
) -> Vec<Edge> {
    let authoritative: HashSet<String> = incoming.iter().map(|e| e.id.clone()).collect();
    let mut merged = upsert_by_id(Vec::new(), incoming, |e| &e.id);

    for edge in local {
        if edge.is_local_created() && !authoritative.contains(&edge.id) {
            report.preserved_local += 1;
            merged.push(edge.clone());
        }
    }

    let deduped = dedupe_endpoints(merged, &authoritative, report);
    drop_dangling(deduped, nodes, report)
}

fn dedupe_endpoints(
    edges: Vec<Edge>,
    authoritative: &HashSet<String>,
    report: &mut MergeReport,
) -> Vec<Edge> {
    let mut kept: Vec<Edge> = Vec::with_capacity(edges.len());
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for edge in edges {
        if edge.is_system_connector() {
            kept.push(edge);
            continue;
        }
        let key = edge.endpoint_key();
        if let Some(&i) = by_key.get(&key) {
            report.deduplicated += 1;
            if !authoritative.contains(&kept[i].id) && authoritative.contains(&edge.id) {
                kept[i] = edge;
            }
        } else {
            by_key.insert(key, kept.len());
            kept.push(edge);
        }
    }
    kept
}

fn drop_dangling(edges: Vec<Edge>, nodes: &[Node], report: &mut MergeReport) -> Vec<Edge> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let before = edges.len();
    let kept: Vec<Edge> = edges
        .into_iter()
        .filter(|e| ids.contains(e.source.as_str()) && ids.contains(e.target.as_str()))
        .collect();
    report.dangling_dropped += before - kept.len();
    kept
}

// =============================================================================
// PAYLOAD ENTRY POINTS
// =============================================================================

/// Parse a `{nodes, edges}` state object.
///
/// # Errors
///
/// Returns [`ReconcileError`] when `state` is not an object or its arrays do
/// not hold valid nodes and edges.
pub fn parse_snapshot(state: &Value) -> Result<Snapshot, ReconcileError> {
    if !state.is_object() {
        return Err(ReconcileError::Shape("a state object"));
    }
    serde_json::from_value(state.clone()).map_err(ReconcileError::malformed("state"))
}

/// Full merge of an untyped state object.
///
/// # Errors
///
/// Returns [`ReconcileError`] for a malformed state; the store is untouched.
pub fn apply_full(store: &mut DiagramStore, state: &Value) -> Result<MergeReport, ReconcileError> {
    let snapshot = parse_snapshot(state)?;
    Ok(merge_full(store, snapshot).commit(store))
}

/// Replace one collection from an untyped instant-change array.
///
/// # Errors
///
/// Returns [`ReconcileError`] when `elements` is not an array of the
/// collection's element type; the store is untouched.
pub fn apply_collection(
    store: &mut DiagramStore,
    collection: Collection,
    elements: &Value,
) -> Result<MergeReport, ReconcileError> {
    if !elements.is_array() {
        return Err(ReconcileError::Shape("an element array"));
    }
    let merged = match collection {
        Collection::Nodes => {
            let nodes: Vec<Node> = serde_json::from_value(elements.clone())
                .map_err(ReconcileError::malformed("nodes"))?;
            replace_nodes(store, nodes)
        }
        Collection::Edges => {
            let edges: Vec<Edge> = serde_json::from_value(elements.clone())
                .map_err(ReconcileError::malformed("edges"))?;
            replace_edges(store, edges)
        }
    };
    Ok(merged.commit(store))
}

/// Partial merge of one element or an array of elements, classified by
/// shape. Nodes are merged before edges so new edges can reference new
/// nodes from the same batch.
///
/// # Errors
///
/// Returns [`ReconcileError`] when any element fails to parse; nothing is
/// applied in that case.
pub fn apply_elements(store: &mut DiagramStore, elements: &Value) -> Result<MergeReport, ReconcileError> {
    let items: Vec<&Value> = match elements {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![elements],
        _ => return Err(ReconcileError::Shape("an element or element array")),
    };

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut patches = Vec::new();
    for item in items {
        match detect_shape(item) {
            ElementShape::Node => nodes.push(parse_node(item)?),
            ElementShape::Edge => edges.push(parse_edge(item)?),
            ElementShape::Patch => patches.push(parse_patch(item)?),
        }
    }

    // Patches are resolved against a scratch copy so a bad one aborts the
    // whole batch.
    let mut scratch = DiagramStore::from_snapshot(store.snapshot());
    let mut report = MergeReport::default();
    if !nodes.is_empty() {
        report = merge_partial_nodes(&scratch, nodes).commit(&mut scratch);
    }
    if !edges.is_empty() {
        report = merge_partial_edges(&scratch, edges).commit(&mut scratch);
    }
    for (id, data) in patches {
        patch_data(&mut scratch, &id, &data)?;
    }
    report.nodes = scratch.nodes().len();
    report.edges = scratch.edges().len();
    store.replace(scratch.snapshot());
    Ok(report)
}

/// Delete the elements named by `elements`: an id string, an element
/// object, or an array of either.
///
/// # Errors
///
/// Returns [`ReconcileError`] when no id can be read from the payload.
pub fn apply_delete(store: &mut DiagramStore, elements: &Value) -> Result<MergeReport, ReconcileError> {
    let ids = collect_ids(elements);
    if ids.is_empty() {
        return Err(ReconcileError::Shape("element ids to delete"));
    }
    Ok(remove_elements(store, &ids).commit(store))
}

fn collect_ids(elements: &Value) -> HashSet<String> {
    match elements {
        Value::String(id) => HashSet::from([id.clone()]),
        Value::Object(obj) => obj
            .get("id")
            .and_then(Value::as_str)
            .map(|id| HashSet::from([id.to_owned()]))
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(collect_ids).collect(),
        _ => HashSet::new(),
    }
}

fn parse_node(value: &Value) -> Result<Node, ReconcileError> {
    serde_json::from_value(value.clone()).map_err(ReconcileError::malformed("node"))
}

fn parse_edge(value: &Value) -> Result<Edge, ReconcileError> {
    serde_json::from_value(value.clone()).map_err(ReconcileError::malformed("edge"))
}

fn parse_patch(value: &Value) -> Result<(String, Value), ReconcileError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or(ReconcileError::Shape("an element id"))?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    if !data.is_object() {
        return Err(ReconcileError::Shape("an object data patch"));
    }
    Ok((id.to_owned(), data))
}

/// Shallow-merge `data` into whichever node and edge carry `id`. Position,
/// endpoints and handles are never touched.
fn patch_data(store: &mut DiagramStore, id: &str, data: &Value) -> Result<(), ReconcileError> {
    if let Some(node) = store.node(id) {
        let patched: NodeData = merge_patch(&node.data, data).map_err(ReconcileError::malformed("node data"))?;
        let nodes = store
            .nodes()
            .iter()
            .map(|n| if n.id == id { Node { data: patched.clone(), ..n.clone() } } else { n.clone() })
            .collect();
        store.set_nodes(nodes);
    }
    if let Some(edge) = store.edge(id) {
        let patched: EdgeData = merge_patch(&edge.data, data).map_err(ReconcileError::malformed("edge data"))?;
        let edges = store
            .edges()
            .iter()
            .map(|e| if e.id == id { Edge { data: patched.clone(), ..e.clone() } } else { e.clone() })
            .collect();
        store.set_edges(edges);
    }
    if store.node(id).is_none() && store.edge(id).is_none() {
        debug!(%id, "data patch for unknown element ignored");
    }
    Ok(())
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
