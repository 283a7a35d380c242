//! Typed protocol events carried inside [`Frame`] envelopes.
//!
//! Inbound frames are parsed into [`Inbound`] by event name. Payload fields
//! that hold diagram content stay as `serde_json::Value` here: the reconciler
//! parses them so a malformed element can be rejected without touching the
//! store. Outbound builders produce the exact payload shapes the realtime
//! server expects (`roomId`, `usuario`, `tipo`, `elemento`, ...).

use frames::{Frame, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::model::{Snapshot, UserIdentity, string_or_number};

pub const JOIN_ROOM: &str = "joinRoom";
pub const INSTANT_CHANGE: &str = "instantChange";
pub const ELEMENT_OPERATION: &str = "elementOperation";
pub const UPDATE_DIAGRAM: &str = "updateDiagram";
pub const SAVE_STATE: &str = "saveState";
pub const REQUEST_STATE: &str = "requestState";

pub const INITIAL_STATE: &str = "initialState";
pub const STATE_UPDATED: &str = "stateUpdated";
pub const USERS_CONNECTED: &str = "usersConnected";
pub const USER_JOINED: &str = "userJoined";
pub const USER_LEFT: &str = "userLeft";
pub const CHANGE_RECEIVED: &str = "changeReceived";
pub const ELEMENT_OPERATED: &str = "elementOperated";
pub const DIAGRAM_UPDATED: &str = "diagramUpdated";
pub const STATE_SAVED: &str = "stateSaved";

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// INBOUND
// =============================================================================

/// `tipo` of an instant change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Nodes,
    Edges,
    AddNode,
    UpdateNode,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Edges => "edges",
            Self::AddNode => "addNode",
            Self::UpdateNode => "updateNode",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "nodes" => Some(Self::Nodes),
            "edges" => Some(Self::Edges),
            "addNode" => Some(Self::AddNode),
            "updateNode" => Some(Self::UpdateNode),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    InitialState { state: Value },
    StateUpdated { new_state: Value },
    UsersConnected { users: Vec<UserIdentity> },
    UserJoined { user: UserIdentity },
    UserLeft { user_id: String },
    ChangeReceived { usuario: Option<UserIdentity>, tipo: String, elemento: Value },
    ElementOperated { usuario: Option<UserIdentity>, operacion: Option<String>, elemento: Value },
    DiagramUpdated { usuario: Option<UserIdentity>, state: Value },
    StateSaved(SaveAck),
}

/// Server acknowledgement of a `saveState`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAck {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl SaveAck {
    /// Read a direct reply to our `saveState`. An `Error` reply is a failed
    /// save whatever its body says.
    fn from_reply(frame: &Frame) -> Result<Self, EventError> {
        let mut ack: Self = parse(frame, &frame.data)?;
        if frame.status == Status::Error {
            ack.success = false;
            ack.error = ack
                .error
                .or_else(|| frame.data.get("message").and_then(Value::as_str).map(str::to_owned))
                .or_else(|| Some("save failed".to_owned()));
        }
        Ok(ack)
    }
}

fn default_true() -> bool {
    true
}

/// Result of a save request as reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SaveOutcome {
    #[must_use]
    pub fn timeout() -> Self {
        Self { success: false, error: Some("timeout".to_owned()) }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()) }
    }
}

impl From<SaveAck> for SaveOutcome {
    fn from(ack: SaveAck) -> Self {
        Self { success: ack.success, error: ack.error }
    }
}

#[derive(Deserialize)]
struct InitialStatePayload {
    state: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateUpdatedPayload {
    new_state: Value,
}

#[derive(Deserialize)]
struct UsersConnectedPayload {
    users: Vec<UserIdentity>,
}

#[derive(Deserialize)]
struct UserJoinedPayload {
    user: UserIdentity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserLeftPayload {
    #[serde(deserialize_with = "string_or_number")]
    user_id: String,
}

#[derive(Deserialize)]
struct ChangePayload {
    #[serde(default)]
    usuario: Option<UserIdentity>,
    tipo: String,
    elemento: Value,
}

#[derive(Deserialize)]
struct OperationPayload {
    #[serde(default)]
    usuario: Option<UserIdentity>,
    #[serde(default)]
    operacion: Option<String>,
    elemento: Value,
}

#[derive(Deserialize)]
struct DiagramUpdatedPayload {
    #[serde(default)]
    usuario: Option<UserIdentity>,
    data: DiagramData,
}

#[derive(Deserialize)]
struct DiagramData {
    state: Value,
}

impl Inbound {
    /// Parse an inbound event frame. Events this client does not handle
    /// return `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] when a known event carries a payload
    /// of the wrong shape.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, EventError> {
        let data = &frame.data;
        let event = match frame.event.as_str() {
            INITIAL_STATE => {
                let p: InitialStatePayload = parse(frame, data)?;
                Self::InitialState { state: p.state }
            }
            STATE_UPDATED => {
                let p: StateUpdatedPayload = parse(frame, data)?;
                Self::StateUpdated { new_state: p.new_state }
            }
            USERS_CONNECTED => {
                let p: UsersConnectedPayload = parse(frame, data)?;
                Self::UsersConnected { users: p.users }
            }
            USER_JOINED => {
                let p: UserJoinedPayload = parse(frame, data)?;
                Self::UserJoined { user: p.user }
            }
            USER_LEFT => {
                let p: UserLeftPayload = parse(frame, data)?;
                Self::UserLeft { user_id: p.user_id }
            }
            CHANGE_RECEIVED => {
                let p: ChangePayload = parse(frame, data)?;
                Self::ChangeReceived { usuario: p.usuario, tipo: p.tipo, elemento: p.elemento }
            }
            ELEMENT_OPERATED => {
                let p: OperationPayload = parse(frame, data)?;
                Self::ElementOperated { usuario: p.usuario, operacion: p.operacion, elemento: p.elemento }
            }
            DIAGRAM_UPDATED => {
                let p: DiagramUpdatedPayload = parse(frame, data)?;
                Self::DiagramUpdated { usuario: p.usuario, state: p.data.state }
            }
            STATE_SAVED => Self::StateSaved(parse(frame, data)?),
            SAVE_STATE if frame.status.is_reply() => Self::StateSaved(SaveAck::from_reply(frame)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Originating user of a change-carrying event.
    #[must_use]
    pub fn origin(&self) -> Option<&UserIdentity> {
        match self {
            Self::ChangeReceived { usuario, .. }
            | Self::ElementOperated { usuario, .. }
            | Self::DiagramUpdated { usuario, .. } => usuario.as_ref(),
            _ => None,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame, data: &Value) -> Result<T, EventError> {
    serde_json::from_value(data.clone())
        .map_err(|source| EventError::Malformed { event: frame.event.clone(), source })
}

// =============================================================================
// OUTBOUND
// =============================================================================

fn outbound(event: &str, room_id: &str, user: Option<&UserIdentity>, data: Value) -> Frame {
    let frame = Frame::event(event, data).with_room_id(room_id);
    match user {
        Some(user) => frame.with_from(user.label()),
        None => frame,
    }
}

#[must_use]
pub fn join_room(room_id: &str, user: &UserIdentity) -> Frame {
    outbound(JOIN_ROOM, room_id, Some(user), json!({"roomId": room_id, "usuario": user}))
}

#[must_use]
pub fn instant_change(room_id: &str, user: &UserIdentity, tipo: ChangeKind, elemento: Value) -> Frame {
    outbound(
        INSTANT_CHANGE,
        room_id,
        Some(user),
        json!({"roomId": room_id, "usuario": user, "tipo": tipo.as_str(), "elemento": elemento}),
    )
}

#[must_use]
pub fn element_operation(room_id: &str, user: &UserIdentity, operacion: &str, elemento: Value) -> Frame {
    outbound(
        ELEMENT_OPERATION,
        room_id,
        Some(user),
        json!({"roomId": room_id, "usuario": user, "operacion": operacion, "elemento": elemento}),
    )
}

#[must_use]
pub fn update_diagram(room_id: &str, user: &UserIdentity, state: &Snapshot) -> Frame {
    outbound(
        UPDATE_DIAGRAM,
        room_id,
        Some(user),
        json!({"roomId": room_id, "usuario": user, "action": "fullState", "data": {"state": state}}),
    )
}

#[must_use]
pub fn save_state(room_id: &str, state: &Snapshot) -> Frame {
    outbound(SAVE_STATE, room_id, None, json!({"roomId": room_id, "estado": state}))
}

#[must_use]
pub fn request_state(room_id: &str) -> Frame {
    outbound(REQUEST_STATE, room_id, None, json!({"roomId": room_id}))
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
