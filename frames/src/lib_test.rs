use serde_json::json;

use super::*;

fn wire(event: &str, status: i32, data: Option<prost_types::Value>) -> Vec<u8> {
    WireFrame {
        id: "f-1".to_owned(),
        parent_id: None,
        ts: 1,
        room_id: None,
        sender: None,
        event: event.to_owned(),
        status,
        data,
    }
    .encode_to_vec()
}

#[test]
fn change_frame_survives_the_wire() {
    let frame = Frame {
        id: "f-9".to_owned(),
        parent_id: Some("f-8".to_owned()),
        ts: 42,
        room_id: Some("room-1".to_owned()),
        from: Some("ana@example.com".to_owned()),
        event: "instantChange".to_owned(),
        status: Status::Done,
        data: json!({
            "tipo": "nodes",
            "elemento": [{"id": "n-1", "position": {"x": 1.5, "y": -3.25}, "selected": null}],
            "dragging": false
        }),
    };
    assert_eq!(decode_frame(&encode_frame(&frame)).expect("decode"), frame);
}

#[test]
fn sender_travels_in_field_five() {
    let frame = Frame::event("instantChange", json!({})).with_from("luis@example.com");
    let wire = WireFrame::decode(encode_frame(&frame).as_slice()).expect("decode");
    assert_eq!(wire.sender.as_deref(), Some("luis@example.com"));
    assert_eq!(decode_frame(&wire.encode_to_vec()).expect("decode").from.as_deref(), Some("luis@example.com"));
}

#[test]
fn wire_status_values_are_stable() {
    let frame = |status| Frame { status, ..Frame::event("joinRoom", json!({})) };
    for (status, raw) in [(Status::Request, 0), (Status::Done, 1), (Status::Error, 2)] {
        assert_eq!(WireFrame::from(&frame(status)).status, raw);
        let decoded = decode_frame(&wire("joinRoom", raw, None)).expect("decode");
        assert_eq!(decoded.status, status);
    }
}

#[test]
fn unknown_wire_status_is_rejected() {
    let err = decode_frame(&wire("joinRoom", 77, None)).expect_err("status 77");
    assert!(matches!(err, CodecError::InvalidStatus(77)));
}

#[test]
fn garbage_bytes_are_rejected() {
    assert!(matches!(decode_frame(&[0xff, 0x00, 0x01]), Err(CodecError::Decode(_))));
}

#[test]
fn absent_payload_decodes_as_empty_object() {
    let frame = decode_frame(&wire("requestState", 0, None)).expect("decode");
    assert_eq!(frame.data, json!({}));
}

#[test]
fn non_finite_numbers_decode_as_null() {
    let nan = prost_types::Value { kind: Some(Kind::NumberValue(f64::NAN)) };
    let frame = decode_frame(&wire("stateUpdated", 0, Some(nan))).expect("decode");
    assert_eq!(frame.data, Value::Null);
}

#[test]
fn integers_come_back_as_floats() {
    let frame = Frame::event("instantChange", json!({"x": 2}));
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    assert_eq!(decoded.data["x"], json!(2.0));
}

#[test]
fn event_frames_get_fresh_uuid_ids() {
    let a = Frame::event("joinRoom", json!({})).with_room_id("room-7").with_from("u-1");
    let b = Frame::event("joinRoom", json!({}));
    assert_ne!(a.id, b.id);
    assert!(Uuid::parse_str(&a.id).is_ok());
    assert_eq!(a.status, Status::Request);
    assert_eq!(a.room_id.as_deref(), Some("room-7"));
    assert_eq!(a.from.as_deref(), Some("u-1"));
    assert!(a.ts > 0);
}

#[test]
fn replies_point_back_at_their_request() {
    let join = Frame::event("joinRoom", json!({})).with_room_id("room-7");

    let ack = join.done(json!({"ok": true}));
    assert!(ack.is_reply_to(&join.id));
    assert_eq!((ack.event.as_str(), ack.room_id.as_deref()), ("joinRoom", Some("room-7")));

    let nack = join.error("room is full");
    assert!(nack.is_reply_to(&join.id));
    assert_eq!(nack.data["message"], json!("room is full"));
}

#[test]
fn a_request_with_parent_id_is_not_a_reply() {
    let join = Frame::event("joinRoom", json!({}));
    let mut echoed = Frame::event("joinRoom", json!({}));
    echoed.parent_id = Some(join.id.clone());
    assert!(!echoed.is_reply_to(&join.id));
}

#[test]
fn status_json_is_lowercase() {
    assert_eq!(serde_json::to_value(Status::Done).expect("serialize"), json!("done"));
    assert!(serde_json::from_str::<Status>("\"Done\"").is_err());
}
