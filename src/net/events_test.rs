use super::*;

fn ana() -> UserIdentity {
    UserIdentity { id: None, name: "Ana".into(), email: Some("ana@example.com".into()) }
}

fn inbound(event: &str, data: Value) -> Result<Option<Inbound>, EventError> {
    Inbound::from_frame(&Frame::event(event, data))
}

#[test]
fn initial_state_requires_state_field() {
    let ok = inbound(INITIAL_STATE, json!({"state": {"nodes": [], "edges": []}})).expect("parse");
    assert!(matches!(ok, Some(Inbound::InitialState { .. })));

    let err = inbound(INITIAL_STATE, json!({"nodes": []})).expect_err("missing state");
    assert!(matches!(err, EventError::Malformed { ref event, .. } if event == INITIAL_STATE));
}

#[test]
fn state_updated_reads_camel_case_new_state() {
    let event = inbound(STATE_UPDATED, json!({"newState": {"nodes": []}})).expect("parse");
    assert_eq!(event, Some(Inbound::StateUpdated { new_state: json!({"nodes": []}) }));
}

#[test]
fn presence_events_parse_users() {
    let event = inbound(
        USERS_CONNECTED,
        json!({"users": [{"name": "Ana", "email": "ana@example.com", "color": "#f00"}]}),
    )
    .expect("parse");
    match event {
        Some(Inbound::UsersConnected { users }) => assert_eq!(users, vec![ana()]),
        other => panic!("unexpected {other:?}"),
    }

    let left = inbound(USER_LEFT, json!({"userId": "u-1"})).expect("parse");
    assert_eq!(left, Some(Inbound::UserLeft { user_id: "u-1".into() }));
}

#[test]
fn numeric_user_ids_do_not_break_payloads() {
    let left = inbound(USER_LEFT, json!({"userId": 17.0})).expect("parse");
    assert_eq!(left, Some(Inbound::UserLeft { user_id: "17".into() }));

    let event = inbound(
        CHANGE_RECEIVED,
        json!({"usuario": {"id": 9.0, "name": "Luis"}, "tipo": "nodes", "elemento": []}),
    )
    .expect("parse")
    .expect("known event");
    assert_eq!(event.origin().and_then(|u| u.id.as_deref()), Some("9"));
}

#[test]
fn change_received_exposes_origin() {
    let event = inbound(
        CHANGE_RECEIVED,
        json!({"usuario": {"name": "Ana", "email": "ana@example.com"}, "tipo": "nodes", "elemento": []}),
    )
    .expect("parse")
    .expect("known event");

    assert_eq!(event.origin(), Some(&ana()));
}

#[test]
fn diagram_updated_reads_nested_state() {
    let event = inbound(DIAGRAM_UPDATED, json!({"action": "fullState", "data": {"state": {"nodes": []}}}))
        .expect("parse");
    assert_eq!(
        event,
        Some(Inbound::DiagramUpdated { usuario: None, state: json!({"nodes": []}) })
    );
}

#[test]
fn state_saved_defaults_to_success() {
    let event = inbound(STATE_SAVED, json!({"roomId": "room-1"})).expect("parse");
    let Some(Inbound::StateSaved(ack)) = event else { panic!("expected stateSaved") };
    assert!(ack.success);
    assert_eq!(ack.room_id.as_deref(), Some("room-1"));

    let outcome = SaveOutcome::from(SaveAck { room_id: None, success: false, error: Some("disk".into()) });
    assert_eq!(outcome, SaveOutcome::failed("disk"));
}

#[test]
fn direct_save_replies_read_as_acks() {
    let save = save_state("room-1", &Snapshot::default());

    let done = Inbound::from_frame(&save.done(json!({"roomId": "room-1"}))).expect("parse");
    let Some(Inbound::StateSaved(ack)) = done else { panic!("expected save ack") };
    assert!(ack.success);

    let failed = Inbound::from_frame(&save.error("disk full")).expect("parse");
    let Some(Inbound::StateSaved(ack)) = failed else { panic!("expected save ack") };
    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("disk full"));

    // A plain saveState request from a peer is not an ack.
    assert_eq!(Inbound::from_frame(&save).expect("parse"), None);
}

#[test]
fn unknown_events_are_skipped() {
    assert_eq!(inbound("cursorMoved", json!({})).expect("parse"), None);
}

#[test]
fn change_kind_round_trips_names() {
    for kind in [ChangeKind::Nodes, ChangeKind::Edges, ChangeKind::AddNode, ChangeKind::UpdateNode] {
        assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(ChangeKind::parse("deleteNode"), None);
}

#[test]
fn join_room_carries_room_and_user() {
    let frame = join_room("room-1", &ana());
    assert_eq!(frame.event, JOIN_ROOM);
    assert_eq!(frame.room_id.as_deref(), Some("room-1"));
    assert_eq!(frame.from.as_deref(), Some("ana@example.com"));
    assert_eq!(frame.data["roomId"], json!("room-1"));
    assert_eq!(frame.data["usuario"]["email"], json!("ana@example.com"));
}

#[test]
fn instant_change_payload_shape() {
    let frame = instant_change("room-1", &ana(), ChangeKind::Edges, json!([]));
    assert_eq!(frame.event, INSTANT_CHANGE);
    assert_eq!(frame.data["tipo"], json!("edges"));
    assert_eq!(frame.data["elemento"], json!([]));
    assert_eq!(frame.data["usuario"]["name"], json!("Ana"));
}

#[test]
fn update_diagram_wraps_state_in_full_state_action() {
    let frame = update_diagram("room-1", &ana(), &Snapshot::default());
    assert_eq!(frame.data["action"], json!("fullState"));
    assert_eq!(frame.data["data"]["state"], json!({"nodes": [], "edges": []}));
}

#[test]
fn save_and_request_state_payloads() {
    let save = save_state("room-1", &Snapshot::default());
    assert_eq!(save.event, SAVE_STATE);
    assert_eq!(save.data["estado"], json!({"nodes": [], "edges": []}));
    assert!(save.from.is_none());

    let req = request_state("room-1");
    assert_eq!(req.data, json!({"roomId": "room-1"}));
}

#[test]
fn element_operation_payload_shape() {
    let frame = element_operation("room-1", &ana(), "delete", json!(["n1"]));
    assert_eq!(frame.event, ELEMENT_OPERATION);
    assert_eq!(frame.data["operacion"], json!("delete"));
}
