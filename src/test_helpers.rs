use frames::Frame;
use serde_json::Value;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::model::{ClassData, Node, Position, UserIdentity};
use crate::session::DiagramSession;

pub(crate) const ROOM: &str = "room-1";

pub(crate) fn ana() -> UserIdentity {
    UserIdentity { id: None, name: "Ana".into(), email: Some("ana@example.com".into()) }
}

pub(crate) fn luis() -> UserIdentity {
    UserIdentity { id: None, name: "Luis".into(), email: Some("luis@example.com".into()) }
}

pub(crate) fn config() -> SyncConfig {
    SyncConfig::new("ws://127.0.0.1:1/ws", ROOM, ana())
}

pub(crate) fn session() -> DiagramSession {
    DiagramSession::new(config(), EventBus::new())
}

/// A session whose join has been acknowledged, with the outbox drained.
pub(crate) fn joined_session() -> DiagramSession {
    let mut session = session();
    let now = Instant::now();
    session.on_transport_connected(now);
    let join = session.pop_outbox().expect("join request");
    session.handle_frame(&join.done(serde_json::json!({"ok": true})), now);
    drain(&mut session);
    session
}

pub(crate) fn drain(session: &mut DiagramSession) -> Vec<Frame> {
    std::iter::from_fn(|| session.pop_outbox()).collect()
}

pub(crate) fn class_node(id: &str, x: f64, y: f64) -> Node {
    Node::class(id, Position::new(x, y), ClassData::named(id))
}

pub(crate) fn peer_frame(event: &str, data: Value) -> Frame {
    Frame::event(event, data).with_room_id(ROOM)
}
