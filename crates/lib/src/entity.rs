//! Dynamic entity records and the closed set of collection kinds.
//!
//! Entity schemas are data, not code: a stored record is a JSON object, and
//! only the base stamps (`id`, `createdAt`, `updatedAt`, `createdBy`,
//! `updatedBy`) have meaning to the engine itself. The engine sets all of
//! them; they are never trusted from a client.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// The base fields present on every stored record. Always retained by
/// redaction regardless of a collection's allow-list.
pub const BASE_FIELDS: [&str; 5] = ["id", "createdAt", "updatedAt", "createdBy", "updatedBy"];

/// Author sentinel used when no authenticated caller produced a write.
pub const SYSTEM_USER: &str = "system";

/// The closed set of collection kinds served by the engine.
///
/// Kind names double as the wire strings used in event and room names
/// (`user.read`, `instrument:abc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Session,
    Account,
    Access,
    Ace,
    Instrument,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Session,
        EntityKind::Account,
        EntityKind::Access,
        EntityKind::Ace,
        EntityKind::Instrument,
    ];

    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Session => "session",
            EntityKind::Account => "account",
            EntityKind::Access => "access",
            EntityKind::Ace => "ace",
            EntityKind::Instrument => "instrument",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn parse(name: &str) -> Option<EntityKind> {
        EntityKind::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored entity record: a JSON object with typed access to the base
/// stamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// The record's primary key, if assigned.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("id".to_string(), Value::String(id.into()));
    }

    pub fn created_at(&self) -> Option<i64> {
        self.0.get("createdAt").and_then(Value::as_i64)
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.0.get("updatedAt").and_then(Value::as_i64)
    }

    pub fn created_by(&self) -> Option<&str> {
        self.0.get("createdBy").and_then(Value::as_str)
    }

    pub fn updated_by(&self) -> Option<&str> {
        self.0.get("updatedBy").and_then(Value::as_str)
    }

    /// Stamp the creation fields. `createdAt` is clamped so it never
    /// exceeds `updatedAt`.
    pub fn stamp_created(&mut self, now: i64, author: &str) {
        self.set("createdAt", Value::from(now));
        self.set("updatedAt", Value::from(now));
        self.set("createdBy", Value::from(author));
        self.set("updatedBy", Value::from(author));
    }

    /// Stamp the update fields.
    pub fn stamp_updated(&mut self, now: i64, author: &str) {
        self.set("updatedAt", Value::from(now));
        self.set("updatedBy", Value::from(author));
    }

    /// Get an arbitrary field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Set an arbitrary field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Overlay every field of `other` onto this record.
    pub fn merge(&mut self, other: &Record) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Drop every field not in `allowed`. Used by redaction, which always
    /// operates on a clone of the stored record.
    pub fn retain_fields(&mut self, allowed: &[String]) {
        self.0.retain(|key, _| allowed.iter().any(|a| a == key));
    }

    /// Field names currently present.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a record from any serializable value. Fails if the value does
    /// not serialize to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> crate::Result<Record> {
        use serde::ser::Error;
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Record(map)),
            other => {
                Err(serde_json::Error::custom(format!("expected object, got {other}")).into())
            }
        }
    }

    /// Deserialize the record into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// View the record as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Record(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Record> {
        use serde::ser::Error;
        match value {
            Value::Object(map) => Ok(Record(map)),
            other => {
                Err(serde_json::Error::custom(format!("expected object, got {other}")).into())
            }
        }
    }
}
