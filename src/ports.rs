//! Port allocator: picks connection handles for new edges.
//!
//! DESIGN
//! ======
//! A `HandleAllocator` is one allocation pass. It remembers which
//! `(node, handle)` pairs the pass has handed out (optionally seeded from
//! edges that already exist) and is dropped when the batch is done, so claims
//! never leak across independent operations.
//!
//! Side choice is geometric: the axis with the larger distance wins, ties go
//! horizontal, and the target gets the opposite side. When a side is full the
//! search moves to adjacent sides before the opposite one. When every slot on
//! a node is taken, the first slot of the preferred side is reused and a
//! warning is logged.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::model::{Edge, HandleId, Node, Position, Side};

/// One end of an edge being allocated.
#[derive(Clone, Copy, Debug)]
pub struct Endpoint<'a> {
    pub id: &'a str,
    pub position: Option<Position>,
}

impl<'a> Endpoint<'a> {
    #[must_use]
    pub fn new(id: &'a str, position: Option<Position>) -> Self {
        Self { id, position }
    }

    /// Resolve an endpoint against a node list; unknown ids have no position.
    #[must_use]
    pub fn lookup(id: &'a str, nodes: &[Node]) -> Self {
        let position = nodes.iter().find(|n| n.id == id).map(|n| n.position);
        Self { id, position }
    }
}

impl<'a> From<&'a Node> for Endpoint<'a> {
    fn from(node: &'a Node) -> Self {
        Self { id: &node.id, position: Some(node.position) }
    }
}

/// Handles chosen for one edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlePair {
    pub source: HandleId,
    pub target: HandleId,
}

/// Ordered slots on one side.
#[must_use]
pub fn slots(side: Side) -> &'static [HandleId] {
    match side {
        Side::Right => &[HandleId::RightTop, HandleId::RightCenter, HandleId::RightBottom],
        Side::Left => &[HandleId::LeftTop, HandleId::LeftCenter, HandleId::LeftBottom],
        Side::Top => &[HandleId::TopCenter],
        Side::Bottom => &[HandleId::BottomCenter],
    }
}

/// Search order starting at `preferred`: adjacent sides, then the opposite.
fn search_order(preferred: Side) -> [Side; 4] {
    match preferred {
        Side::Right => [Side::Right, Side::Top, Side::Bottom, Side::Left],
        Side::Left => [Side::Left, Side::Top, Side::Bottom, Side::Right],
        Side::Top => [Side::Top, Side::Right, Side::Left, Side::Bottom],
        Side::Bottom => [Side::Bottom, Side::Right, Side::Left, Side::Top],
    }
}

/// Side of `from` that faces `to`. Screen coordinates: y grows downward.
#[must_use]
pub fn dominant_side(from: Position, to: Position) -> Side {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    if dx.abs() >= dy.abs() {
        if dx >= 0.0 { Side::Right } else { Side::Left }
    } else if dy >= 0.0 {
        Side::Bottom
    } else {
        Side::Top
    }
}

#[derive(Debug, Default)]
pub struct HandleAllocator {
    claimed: HashMap<String, HashSet<HandleId>>,
}

impl HandleAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass with the handles already used by `edges` marked taken.
    #[must_use]
    pub fn seeded<'a>(edges: impl IntoIterator<Item = &'a Edge>) -> Self {
        let mut allocator = Self::new();
        for edge in edges {
            if let Some(handle) = edge.source_handle {
                allocator.claim(&edge.source, handle);
            }
            if let Some(handle) = edge.target_handle {
                allocator.claim(&edge.target, handle);
            }
        }
        allocator
    }

    pub fn claim(&mut self, node_id: &str, handle: HandleId) {
        self.claimed.entry(node_id.to_owned()).or_default().insert(handle);
    }

    #[must_use]
    pub fn is_claimed(&self, node_id: &str, handle: HandleId) -> bool {
        self.claimed.get(node_id).is_some_and(|set| set.contains(&handle))
    }

    /// Choose and claim a handle pair for an edge from `source` to `target`.
    pub fn allocate(&mut self, source: Endpoint<'_>, target: Endpoint<'_>) -> HandlePair {
        let (Some(from), Some(to)) = (source.position, target.position) else {
            let pair = HandlePair { source: HandleId::RightCenter, target: HandleId::LeftCenter };
            self.claim(source.id, pair.source);
            self.claim(target.id, pair.target);
            return pair;
        };

        // The source is claimed before the target search so a self-loop
        // never gets the same handle at both ends.
        let side = dominant_side(from, to);
        let source_handle = self.free_handle(source.id, side);
        self.claim(source.id, source_handle);
        let target_handle = self.free_handle(target.id, side.opposite());
        self.claim(target.id, target_handle);
        HandlePair { source: source_handle, target: target_handle }
    }

    fn free_handle(&self, node_id: &str, preferred: Side) -> HandleId {
        let free = search_order(preferred)
            .into_iter()
            .flat_map(|side| slots(side).iter().copied())
            .find(|handle| !self.is_claimed(node_id, *handle));
        if let Some(handle) = free {
            return handle;
        }

        let fallback = slots(preferred)[0];
        warn!(%node_id, side = ?preferred, handle = %fallback, "handle slots exhausted; reusing preferred slot");
        fallback
    }
}

#[cfg(test)]
#[path = "ports_test.rs"]
mod tests;
