use serde_json::json;

use super::*;
use crate::model::HandleId;
use crate::net::events;
use crate::test_helpers::{class_node, drain, joined_session};

fn board() -> Snapshot {
    Snapshot { nodes: vec![class_node("A", 0.0, 0.0), class_node("B", 400.0, 0.0)], edges: Vec::new() }
}

fn diagram(value: serde_json::Value) -> GeneratedDiagram {
    serde_json::from_value(value).expect("diagram")
}

#[test]
fn result_parses_service_payload() {
    let result: GenerationResult = serde_json::from_value(json!({
        "success": true,
        "message": "ok",
        "diagram": {
            "elements": [{"id": "1", "name": "Libro", "attributes": ["- isbn: String"]}],
            "relationships": [{"from": "1", "to": "Autor", "type": "inheritance", "cardinality": "*:1"}],
            "clarifyingQuestions": ["¿Un libro tiene varios autores?"]
        }
    }))
    .expect("result");

    let diagram = result.diagram.expect("diagram");
    assert_eq!(diagram.elements[0].class_name.as_deref(), Some("Libro"));
    assert_eq!(diagram.relationships[0].kind, RelationKind::Generalization);
    assert_eq!(diagram.clarifying_questions.len(), 1);
}

#[test]
fn new_elements_are_laid_out_right_of_the_diagram() {
    let plan = plan_import(
        &board(),
        &diagram(json!({"elements": [
            {"className": "C"}, {"className": "D"}, {"className": "E"}, {"className": "F"}
        ]})),
    );

    let positions: Vec<Position> = plan.nodes.iter().map(|n| n.position).collect();
    assert_eq!(
        positions,
        vec![
            Position::new(700.0, 0.0),
            Position::new(1000.0, 0.0),
            Position::new(1300.0, 0.0),
            Position::new(700.0, 250.0),
        ]
    );
    assert_eq!(plan.nodes_added, 4);
}

#[test]
fn empty_board_grid_starts_at_origin() {
    let plan = plan_import(&Snapshot::default(), &diagram(json!({"elements": [{"className": "Solo"}]})));
    assert_eq!(plan.nodes[0].position, Position::default());
}

#[test]
fn matching_class_name_merges_members() {
    let mut current = board();
    if let NodeData::Class(data) = &mut current.nodes[0].data {
        data.attributes = vec!["- id: int".into()];
    }

    let plan = plan_import(
        &current,
        &diagram(json!({"elements": [
            {"className": "a", "attributes": ["- id: int", "- nombre: String"], "methods": ["+ guardar()"]}
        ]})),
    );

    assert_eq!(plan.nodes_added, 0);
    assert_eq!(plan.nodes_updated, 1);
    let node = &plan.nodes[0];
    assert_eq!(node.id, "A");
    assert_eq!(node.position, Position::new(0.0, 0.0));
    match &node.data {
        NodeData::Class(c) => {
            assert_eq!(c.attributes, vec!["- id: int".to_owned(), "- nombre: String".to_owned()]);
            assert_eq!(c.methods, vec!["+ guardar()".to_owned()]);
        }
        NodeData::Note(_) => panic!("expected class"),
    }
}

#[test]
fn relationships_resolve_by_element_id_and_class_name() {
    let plan = plan_import(
        &board(),
        &diagram(json!({
            "elements": [{"id": "x1", "className": "C", "position": {"x": 800.0, "y": 0.0}}],
            "relationships": [
                {"source": "x1", "target": "B", "type": "Composition", "cardinality": "1:*"},
                {"source": "A", "target": "B"}
            ]
        })),
    );

    assert_eq!(plan.edges.len(), 2);
    let composed = &plan.edges[0];
    assert_eq!(composed.source, plan.nodes[0].id);
    assert_eq!(composed.target, "B");
    assert_eq!(composed.data.kind, RelationKind::Composition);
    assert_eq!(composed.data.start_label.as_deref(), Some("1"));
    assert_eq!(composed.data.end_label.as_deref(), Some("*"));
    assert!(composed.is_local_created());

    // C sits right of B, so B's left side serves it.
    assert_eq!(composed.source_handle, Some(HandleId::LeftTop));
    assert_eq!(composed.target_handle, Some(HandleId::RightTop));
    let plain = &plan.edges[1];
    assert_eq!(plain.source_handle, Some(HandleId::RightTop));
    assert_eq!(plain.target_handle, Some(HandleId::LeftTop));
}

#[test]
fn unresolved_relationship_is_skipped() {
    let plan = plan_import(&board(), &diagram(json!({"relationships": [{"source": "A", "target": "Nadie"}]})));
    assert!(plan.edges.is_empty());
    assert_eq!(plan.skipped, vec!["A -> Nadie".to_owned()]);
}

#[test]
fn restated_relationship_keeps_the_existing_edge() {
    let mut current = board();
    current.edges.push(Edge::new("srv1", "A", "B", EdgeData::default()));

    let plan = plan_import(
        &current,
        &diagram(json!({"relationships": [
            {"source": "A", "target": "B", "type": "Aggregation"},
            {"source": "B", "target": "A"}
        ]})),
    );

    assert!(plan.edges.is_empty());
    assert_eq!(plan.existing, 2);
}

#[test]
fn restated_relationship_is_not_counted_as_added() {
    let mut s = joined_session();
    let mut current = board();
    current.edges.push(Edge::new("srv1", "A", "B", EdgeData::default()));
    s.store.replace(current);

    let outcome = s.apply_generated(GenerationResult {
        success: true,
        diagram: Some(diagram(json!({"relationships": [{"source": "A", "target": "B"}]}))),
        ..GenerationResult::default()
    });

    assert_eq!(outcome.edges_added, 0);
    let ids: Vec<&str> = s.edges().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["srv1"]);
}

#[test]
fn note_elements_become_note_nodes() {
    let plan = plan_import(&board(), &diagram(json!({"elements": [{"type": "note", "text": "revisar"}]})));
    assert_eq!(plan.nodes[0].kind, crate::model::NodeKind::Note);
}

#[test]
fn failed_result_does_not_touch_the_board() {
    let mut s = joined_session();
    s.store.replace(board());
    let revision = s.revision();

    let outcome = s.apply_generated(GenerationResult {
        success: false,
        error: Some("quota".into()),
        ..GenerationResult::default()
    });

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("quota"));
    assert_eq!(s.revision(), revision);
    assert!(drain(&mut s).is_empty());
}

#[test]
fn generated_diagram_is_merged_and_broadcast() {
    let mut s = joined_session();
    s.store.replace(board());

    let outcome = s.apply_generated(GenerationResult {
        success: true,
        diagram: Some(diagram(json!({
            "elements": [{"className": "C"}],
            "relationships": [{"source": "C", "target": "A", "type": "Dependency"}]
        }))),
        ..GenerationResult::default()
    });

    assert!(outcome.success);
    assert_eq!(outcome.nodes_added, 1);
    assert_eq!(outcome.edges_added, 1);
    assert_eq!(s.nodes().len(), 3);
    assert_eq!(s.edges().len(), 1);

    let sent = drain(&mut s);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::UPDATE_DIAGRAM);
    assert!(s.next_deadline().is_some());
}

#[test]
fn new_state_replaces_board_and_fills_handles() {
    let mut s = joined_session();
    let state: Snapshot = serde_json::from_value(json!({
        "nodes": [class_node("P", 0.0, 0.0), class_node("Q", 0.0, 300.0)],
        "edges": [{"id": "e1", "source": "P", "target": "Q", "data": {"type": "Association"}}]
    }))
    .expect("state");

    let outcome = s.apply_generated(GenerationResult { success: true, new_state: Some(state), ..GenerationResult::default() });

    assert!(outcome.success);
    let edge = s.store.edge("e1").expect("edge");
    assert_eq!(edge.source_handle, Some(HandleId::BottomCenter));
    assert_eq!(edge.target_handle, Some(HandleId::TopCenter));
}

#[test]
fn new_state_edge_to_missing_node_is_dropped() {
    let mut s = joined_session();
    let state: Snapshot = serde_json::from_value(json!({
        "nodes": [class_node("P", 0.0, 0.0)],
        "edges": [{"id": "e1", "source": "P", "target": "GHOST"}]
    }))
    .expect("state");

    let outcome = s.apply_generated(GenerationResult { success: true, new_state: Some(state), ..GenerationResult::default() });

    assert!(outcome.success);
    assert_eq!(outcome.edges_added, 0);
    assert!(s.edges().is_empty());
    let sent = drain(&mut s);
    assert_eq!(sent[0].data["data"]["state"]["edges"], json!([]));
}

#[test]
fn result_without_payload_fails() {
    let mut s = joined_session();
    let outcome = s.apply_generated(GenerationResult { success: true, ..GenerationResult::default() });
    assert!(!outcome.success);
}
