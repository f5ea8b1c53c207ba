//! Wire protocol types: the uniform response envelope and the JSON message
//! shapes exchanged over a connection.
//!
//! These types are transport-agnostic; the WebSocket layer in [`crate::net`]
//! only frames them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::entity::{EntityKind, Record};
use crate::store::SortSpec;

/// Outcome of a request: HTTP-style code, human message, and the caller's
/// access label when access was checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl Status {
    /// Log this status the way request handlers report outcomes: success at
    /// info, everything else at warn.
    pub fn log(&self, location: &str, id: Option<&str>) {
        if self.code == 200 {
            info!(
                code = self.code,
                message = %self.message,
                id = id.unwrap_or(""),
                relation = self.relation.as_deref().unwrap_or(""),
                "{location}"
            );
        } else {
            warn!(code = self.code, message = %self.message, "{location}");
        }
    }
}

/// Uniform response envelope for every request operation.
///
/// `values` serializes as `null` when absent; `total` is only meaningful
/// for index responses and is 0 elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: Status,
    pub values: Option<T>,
    pub total: u64,
}

impl<T> Envelope<T> {
    /// The default error envelope: 500 / "Error".
    pub fn error() -> Self {
        Self {
            status: Status {
                code: 500,
                message: "Error".to_string(),
                relation: None,
            },
            values: None,
            total: 0,
        }
    }

    /// The default unauthorized envelope: 403 / "Unauthorized".
    pub fn unauthorized() -> Self {
        Self {
            status: Status {
                code: 403,
                message: "Unauthorized".to_string(),
                relation: None,
            },
            values: None,
            total: 0,
        }
    }

    /// A 404 / "Not Found" envelope.
    pub fn not_found() -> Self {
        Self {
            status: Status {
                code: 404,
                message: "Not Found".to_string(),
                relation: None,
            },
            values: None,
            total: 0,
        }
    }

    /// A 200 envelope with a message and payload.
    pub fn ok(message: impl Into<String>, values: T) -> Self {
        Self {
            status: Status {
                code: 200,
                message: message.into(),
                relation: None,
            },
            values: Some(values),
            total: 0,
        }
    }

    /// An error envelope with the default 500 code and a specific message.
    pub fn error_message(message: impl Into<String>) -> Self {
        let mut envelope = Self::error();
        envelope.status.message = message.into();
        envelope
    }

    /// Map library errors onto the envelope taxonomy: not-found → 404,
    /// unauthorized → 403, invalid request → 500 with the error's message,
    /// anything else → the opaque 500 default (internal detail is logged,
    /// never shown to the caller).
    pub fn from_error(error: &crate::Error) -> Self {
        if error.is_not_found() {
            Self::not_found()
        } else if error.is_unauthorized() {
            Self::unauthorized()
        } else if error.is_invalid_request() {
            Self::error_message(error.to_string())
        } else {
            Self::error()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.code == 200
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.status.relation = Some(relation.into());
        self
    }
}

impl<T: Serialize> Envelope<T> {
    /// Erase the payload type for dispatch across the wire.
    pub fn into_value(self) -> Envelope<Value> {
        Envelope {
            status: self.status,
            values: self
                .values
                .map(|v| serde_json::to_value(v).unwrap_or(Value::Null)),
            total: self.total,
        }
    }
}

/// A message from a connected client: an event name, its payload, and an
/// optional request id. Responses are only sent when `reqId` is present —
/// the optional-callback semantics of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub event: String,
    #[serde(default)]
    pub values: Value,
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
}

/// A message to a connected client: either the acknowledgement of a
/// request or a broadcast event (where the room name is the event name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Ack {
        event: String,
        #[serde(rename = "reqId")]
        req_id: u64,
        response: Envelope<Value>,
    },
    Event {
        event: String,
        values: Value,
    },
}

impl ServerMessage {
    pub fn event_name(&self) -> &str {
        match self {
            ServerMessage::Ack { event, .. } => event,
            ServerMessage::Event { event, .. } => event,
        }
    }
}

/// Payload of a collection/entity request event: the record criteria or
/// field values, plus index options for paged queries.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub values: Option<Record>,
    #[serde(default)]
    pub index: Option<IndexParams>,
}

impl RequestPayload {
    /// Decode from a raw event payload; a missing or null payload is the
    /// empty request.
    pub fn from_value(value: &Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Paging parameters of an index request. Pages are 1-based and 20 records
/// long; an absent page means the first.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexParams {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
}

/// Split a room string `{kind}:{entityId}` (with or without a trailing
/// `:basic`) into its kind and entity id.
pub fn parse_room(room: &str) -> Option<(EntityKind, &str)> {
    let mut parts = room.split(':');
    let kind = EntityKind::parse(parts.next()?)?;
    let entity_id = parts.next()?;
    if entity_id.is_empty() {
        return None;
    }
    Some((kind, entity_id))
}

/// The full-payload room name for an entity.
pub fn room_name(kind: EntityKind, entity_id: &str) -> String {
    format!("{kind}:{entity_id}")
}

/// The redacted-payload room name for an entity.
pub fn basic_room_name(kind: EntityKind, entity_id: &str) -> String {
    format!("{kind}:{entity_id}:basic")
}
