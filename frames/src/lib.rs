//! Shared frame model and protobuf codec for the realtime diagram transport.
//!
//! This crate owns the wire envelope used by the sync engine and the CLI.
//! Event payloads stay flexible (`serde_json::Value`) because the realtime
//! server speaks named events with loosely shaped bodies, while the envelope
//! itself is encoded as protobuf for compact binary WebSocket messages.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use prost_types::value::Kind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
}

/// Position of a frame in a request/acknowledgement exchange.
///
/// Broadcast events and fire-and-forget emits are plain `Request` frames.
/// Acknowledgements (`joinRoom` callbacks) are `Done` or `Error` replies
/// carrying the request id in `parent_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Event or request frame.
    Request,
    /// Affirmative acknowledgement.
    Done,
    /// Negative acknowledgement.
    Error,
}

impl Status {
    fn wire(self) -> WireStatus {
        match self {
            Self::Request => WireStatus::Request,
            Self::Done => WireStatus::Done,
            Self::Error => WireStatus::Error,
        }
    }

    /// Reply statuses terminate a request/acknowledgement exchange.
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// A single message on the realtime wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique identifier for this frame (UUID string). Replayed frames keep
    /// their id, so receivers can use it to discard duplicates.
    pub id: String,
    /// ID of the request frame this is acknowledging, if any.
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    /// Diagram room this frame belongs to, if any.
    pub room_id: Option<String>,
    /// Sender identifier (user id, email, or system label).
    pub from: Option<String>,
    /// Event name, e.g. `"instantChange"`.
    pub event: String,
    /// Lifecycle position of the frame.
    pub status: Status,
    /// Arbitrary JSON payload.
    pub data: Value,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request/event frame with a fresh id.
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            event: event.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create an affirmative acknowledgement for this frame.
    #[must_use]
    pub fn done(&self, data: Value) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create a negative acknowledgement carrying a message.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.into()));
        self.reply(Status::Error, Value::Object(data))
    }

    /// Build a reply frame. Inherits `room_id` and `event`.
    fn reply(&self, status: Status, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            ts: now_ms(),
            room_id: self.room_id.clone(),
            from: None,
            event: self.event.clone(),
            status,
            data,
        }
    }

    #[must_use]
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Whether this frame acknowledges the request with the given id.
    #[must_use]
    pub fn is_reply_to(&self, request_id: &str) -> bool {
        self.status.is_reply() && self.parent_id.as_deref() == Some(request_id)
    }
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    WireFrame::from(frame).encode_to_vec()
}

/// Decode protobuf bytes into a frame.
///
/// A missing payload decodes as an empty object. Numbers come back as
/// floats: the wire carries JSON through `google.protobuf.Value`.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] for out-of-range status values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    Frame::try_from(WireFrame::decode(bytes)?)
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    room_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    sender: Option<String>,
    #[prost(string, tag = "6")]
    event: String,
    #[prost(enumeration = "WireStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireStatus {
    Request = 0,
    Done = 1,
    Error = 2,
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id.clone(),
            parent_id: frame.parent_id.clone(),
            ts: frame.ts,
            room_id: frame.room_id.clone(),
            sender: frame.from.clone(),
            event: frame.event.clone(),
            status: frame.status.wire().into(),
            data: Some(to_proto(&frame.data)),
        }
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = CodecError;

    fn try_from(wire: WireFrame) -> Result<Self, CodecError> {
        let status = match WireStatus::try_from(wire.status) {
            Ok(WireStatus::Request) => Status::Request,
            Ok(WireStatus::Done) => Status::Done,
            Ok(WireStatus::Error) => Status::Error,
            Err(_) => return Err(CodecError::InvalidStatus(wire.status)),
        };
        Ok(Self {
            id: wire.id,
            parent_id: wire.parent_id,
            ts: wire.ts,
            room_id: wire.room_id,
            from: wire.sender,
            event: wire.event,
            status,
            data: wire.data.as_ref().map_or_else(|| Value::Object(Map::new()), from_proto),
        })
    }
}

fn to_proto(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue.into()),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue { values: items.iter().map(to_proto).collect() }),
        Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map.iter().map(|(key, v)| (key.clone(), to_proto(v))).collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn from_proto(value: &prost_types::Value) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(from_proto).collect()),
        Some(Kind::StructValue(fields)) => {
            Value::Object(fields.fields.iter().map(|(key, v)| (key.clone(), from_proto(v))).collect())
        }
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
