//! Diagram data model shared by the store, reconciler, and emitter.
//!
//! DESIGN
//! ======
//! Field names mirror the realtime server's JSON so payloads deserialize
//! straight into these types. Keys this client does not know about are kept
//! in `extra` maps: every instant change re-emits a whole collection, so
//! dropping unknown keys here would erase them for every peer.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// =============================================================================
// GEOMETRY
// =============================================================================

/// A point in diagram (world) coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn midpoint(self, other: Self) -> Self {
        Self { x: (self.x + other.x) / 2.0, y: (self.y + other.y) / 2.0 }
    }
}

/// One side of a node's bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
    Top,
    Bottom,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::Top => Self::Bottom,
            Self::Bottom => Self::Top,
        }
    }
}

/// Named connection point on a node boundary.
///
/// Left and right sides carry three slots; top and bottom carry one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleId {
    LeftTop,
    LeftCenter,
    LeftBottom,
    RightTop,
    RightCenter,
    RightBottom,
    TopCenter,
    BottomCenter,
}

impl HandleId {
    pub const ALL: [Self; 8] = [
        Self::LeftTop,
        Self::LeftCenter,
        Self::LeftBottom,
        Self::RightTop,
        Self::RightCenter,
        Self::RightBottom,
        Self::TopCenter,
        Self::BottomCenter,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeftTop => "left-top",
            Self::LeftCenter => "left-center",
            Self::LeftBottom => "left-bottom",
            Self::RightTop => "right-top",
            Self::RightCenter => "right-center",
            Self::RightBottom => "right-bottom",
            Self::TopCenter => "top-center",
            Self::BottomCenter => "bottom-center",
        }
    }

    #[must_use]
    pub fn side(self) -> Side {
        match self {
            Self::LeftTop | Self::LeftCenter | Self::LeftBottom => Side::Left,
            Self::RightTop | Self::RightCenter | Self::RightBottom => Side::Right,
            Self::TopCenter => Side::Top,
            Self::BottomCenter => Side::Bottom,
        }
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown handle id: {0}")]
pub struct UnknownHandle(String);

impl FromStr for HandleId {
    type Err = UnknownHandle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| UnknownHandle(s.to_owned()))
    }
}

impl Serialize for HandleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HandleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Handles from other editors may carry names this client cannot place.
/// Those become `None` and get reallocated instead of failing the payload.
fn lenient_handle<'de, D>(deserializer: D) -> Result<Option<HandleId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

fn discard_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    serde::de::IgnoredAny::deserialize(deserializer)?;
    Ok(None)
}

/// An id sent as a string or as a number. Numbers arrive as floats after
/// the protobuf codec, so integral values are printed without `.0`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => i.to_string(),
                (None, Some(f)) if f.trunc() == f && f.abs() < 9.0e15 => (f as i64).to_string(),
                _ => n.to_string(),
            },
        }
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(RawId::into_string)
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}

// =============================================================================
// NODES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "classNode")]
    Class,
    #[serde(rename = "noteNode")]
    Note,
}

/// Payload of a UML class node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassData {
    pub class_name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_association_class: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_edge_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClassData {
    #[must_use]
    pub fn named(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            attributes: Vec::new(),
            methods: Vec::new(),
            is_association_class: None,
            associated_edge_id: None,
            extra: Map::new(),
        }
    }
}

/// Payload of a free-text note node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteData {
    pub text: String,
    #[serde(default = "default_true")]
    pub is_note: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeData {
    Class(ClassData),
    Note(NoteData),
}

impl NodeData {
    #[must_use]
    pub fn class_name(&self) -> Option<&str> {
        match self {
            Self::Class(c) => Some(&c.class_name),
            Self::Note(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Position,
    pub data: NodeData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    #[must_use]
    pub fn class(id: impl Into<String>, position: Position, data: ClassData) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Class,
            position,
            data: NodeData::Class(data),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn note(id: impl Into<String>, position: Position, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Note,
            position,
            data: NodeData::Note(NoteData { text: text.into(), is_note: true, extra: Map::new() }),
            extra: Map::new(),
        }
    }
}

// =============================================================================
// EDGES
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    #[default]
    #[serde(alias = "association")]
    Association,
    #[serde(alias = "aggregation")]
    Aggregation,
    #[serde(alias = "composition")]
    Composition,
    #[serde(alias = "generalization", alias = "inheritance")]
    Generalization,
    #[serde(alias = "implementation", alias = "realization")]
    Implementation,
    #[serde(alias = "dependency")]
    Dependency,
    #[serde(alias = "noteConnection")]
    NoteConnection,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeData {
    #[serde(rename = "type", default)]
    pub kind: RelationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_association_connection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_note_connection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_relation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_association_class: Option<bool>,
    /// Set on edges this client created until the server echoes them. Never
    /// written out, and a value arriving from a peer is discarded.
    #[serde(rename = "_localCreated", default, skip_serializing, deserialize_with = "discard_flag")]
    pub local_created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EdgeData {
    #[must_use]
    pub fn of_kind(kind: RelationKind) -> Self {
        Self { kind, ..Self::default() }
    }

    /// Set the cardinality and derive the end labels from it (`"1:*"` →
    /// start `1`, end `*`).
    #[must_use]
    pub fn with_cardinality(mut self, cardinality: &str) -> Self {
        let (start, end) = split_cardinality(cardinality);
        self.cardinality = Some(cardinality.trim().to_owned()).filter(|c| !c.is_empty());
        self.start_label = start;
        self.end_label = end;
        self
    }
}

/// Split `"start:end"` cardinality into its two labels. A value without a
/// colon labels only the target end.
#[must_use]
pub fn split_cardinality(raw: &str) -> (Option<String>, Option<String>) {
    let label = |s: &str| Some(s.trim().to_owned()).filter(|s| !s.is_empty());
    match raw.split_once(':') {
        Some((start, end)) => (label(start), label(end)),
        None => (None, label(raw)),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, deserialize_with = "lenient_handle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<HandleId>,
    #[serde(default, deserialize_with = "lenient_handle", skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<HandleId>,
    #[serde(default)]
    pub data: EdgeData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        data: EdgeData,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            data,
            extra: Map::new(),
        }
    }

    /// Unordered endpoint key: `A→B` and `B→A` share one key.
    #[must_use]
    pub fn endpoint_key(&self) -> String {
        if self.source <= self.target {
            format!("{}::{}", self.source, self.target)
        } else {
            format!("{}::{}", self.target, self.source)
        }
    }

    /// Association-class connectors and note connectors may legitimately
    /// share endpoints with a primary relation.
    #[must_use]
    pub fn is_system_connector(&self) -> bool {
        self.data.is_association_connection == Some(true)
            || self.data.is_note_connection == Some(true)
            || self.data.kind == RelationKind::NoteConnection
    }

    #[must_use]
    pub fn is_local_created(&self) -> bool {
        self.data.local_created == Some(true)
    }

    #[must_use]
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

// =============================================================================
// SNAPSHOT / IDENTITY
// =============================================================================

/// The complete `(nodes, edges)` state at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Who is editing. Carried as `usuario` on every outbound change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(default, deserialize_with = "optional_string_or_number", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserIdentity {
    /// Same person: by id when both sides carry one, otherwise by email.
    #[must_use]
    pub fn is_same_user(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.id.as_deref(), other.id.as_deref()) {
            return a == b;
        }
        match (self.email.as_deref(), other.email.as_deref()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    /// Short label for logs and frame `from` fields.
    #[must_use]
    pub fn label(&self) -> &str {
        self.id
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.name)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Generate an element id: epoch millis plus a random suffix, so clients can
/// mint ids without coordinating.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}-{}-{suffix}", frames::now_ms())
}

/// Shallow-merge a JSON object patch into a typed payload.
///
/// # Errors
///
/// Returns an error if the patch is not an object or the merged value no
/// longer fits `T`.
pub fn merge_patch<T>(current: &T, patch: &Value) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let Some(patch) = patch.as_object() else {
        return Err(serde::de::Error::custom("data patch must be an object"));
    };
    let mut merged = serde_json::to_value(current)?;
    if let Some(target) = merged.as_object_mut() {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(merged)
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
