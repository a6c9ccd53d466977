//! Wire protocol for resource channels.
//!
//! Every frame is a flat JSON object with a mandatory `type` string:
//! ```text
//! { "type": "invoice_updated", "data": { "id": 7, "status": "paid" } }
//!   └──── routing key ────┘  └────────── opaque payload ──────────┘
//! ```
//!
//! There is no versioning, no sequence number, and no acknowledgement.
//! Channels are addressed as `/<resource_type>/<resource_id>` under the
//! duplex endpoint; a resource id of `all` is the unscoped channel.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identity of a resource item.
///
/// Numbers and strings never compare equal: `1` and `"1"` are distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Int(i64),
    Str(String),
}

impl ResourceId {
    /// Read an id from a JSON scalar. Fractional numbers are not ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// Read the `id` field of a record.
    pub fn of(item: &Value) -> Option<Self> {
        item.get("id").and_then(Self::from_value)
    }

    /// JSON scalar form of the id.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ResourceId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for ResourceId {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<u32> for ResourceId {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Percent-encode one URL path segment. `/`, `?` and `#` never leak into
/// the path, and dot segments are encoded so they cannot climb a level.
pub fn path_segment(raw: &str) -> Cow<'_, str> {
    match raw {
        "." => Cow::Borrowed("%2E"),
        ".." => Cow::Borrowed("%2E%2E"),
        _ => urlencoding::encode(raw),
    }
}

/// Identity of one logical channel: `(resource_type, resource_id)`.
///
/// Immutable once built; used as the registry key for session dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    resource_type: String,
    resource_id: ResourceId,
}

impl ChannelKey {
    /// Resource id of the unscoped (broadcast) channel.
    pub const ALL: &'static str = "all";

    /// Key for one resource, or for the broadcast channel when the id is
    /// [`ChannelKey::ALL`].
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<ResourceId>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// The broadcast channel for a resource type.
    pub fn all(resource_type: impl Into<String>) -> Self {
        Self::new(resource_type, Self::ALL)
    }

    /// Resource type component, e.g. `invoices`.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Resource id component.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Whether this is the unscoped channel of its resource type.
    pub fn is_broadcast(&self) -> bool {
        matches!(&self.resource_id, ResourceId::Str(s) if s == Self::ALL)
    }

    /// Channel path, `/<resource_type>/<resource_id>`, each component
    /// percent-encoded as a single segment.
    pub fn path(&self) -> String {
        let id = self.resource_id.to_string();
        format!("/{}/{}", path_segment(&self.resource_type), path_segment(&id))
    }

    /// Full channel URL under a duplex endpoint base.
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// Reasons an inbound frame cannot become an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,
}

/// One decoded message: routing kind plus the remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    /// Every field of the frame except `type`.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Envelope from a kind and its payload fields.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Envelope whose payload is `{ "data": data }`, the shape push deltas use.
    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("data".to_owned(), data);
        Self::new(kind, payload)
    }

    /// Split a full frame value into kind and payload.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut payload) = value else {
            return Err(FrameError::NotAnObject);
        };
        match payload.remove("type") {
            Some(Value::String(kind)) => Ok(Self { kind, payload }),
            _ => Err(FrameError::MissingType),
        }
    }

    /// Parse a raw text frame.
    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(frame)?;
        Self::from_value(value)
    }

    /// Flat wire form. A payload key named `type` is shadowed by the kind.
    pub fn to_value(&self) -> Value {
        let mut object = self.payload.clone();
        object.insert("type".to_owned(), Value::String(self.kind.clone()));
        Value::Object(object)
    }

    /// Text frame for the wire.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// The payload without the kind, as handed to exact-kind listeners.
    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    /// The record a push delta carries: `data` when it is an object,
    /// otherwise the payload itself.
    pub fn item(&self) -> Value {
        match self.payload.get("data") {
            Some(data @ Value::Object(_)) => data.clone(),
            _ => self.payload_value(),
        }
    }

    /// Identity referenced by the frame: `data.id`, a scalar `data`, or `id`.
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self.payload.get("data") {
            Some(data @ Value::Object(_)) => ResourceId::of(data),
            Some(scalar @ (Value::Number(_) | Value::String(_))) => ResourceId::from_value(scalar),
            _ => self.payload.get("id").and_then(ResourceId::from_value),
        }
    }
}
