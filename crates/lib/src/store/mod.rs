//! Durable entity storage.
//!
//! The [`EntityStore`] trait is the interface the engine needs from a
//! persistent per-collection repository: create/find/update/delete by
//! criteria, returning owned records or "not found". Query execution and
//! on-disk format are the implementation's business. [`InMemory`] is the
//! bundled implementation, used by tests and ephemeral deployments.
//!
//! Store failures are caught at this boundary by the request layer and
//! surfaced to callers as the generic error envelope, never a crash.

mod errors;
mod in_memory;

pub use errors::StoreError;
pub use in_memory::InMemory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::entity::{EntityKind, Record};

/// Equality criteria for record queries: every listed field must match the
/// stored value exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criteria(Map<String, Value>);

impl Criteria {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build criteria from (field, value) pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Match a single id.
    pub fn id(id: impl Into<String>) -> Self {
        Self::from_pairs([("id", Value::String(id.into()))])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `record` satisfies every criterion.
    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

impl From<Record> for Criteria {
    fn from(record: Record) -> Self {
        let value = record.to_value();
        match value {
            Value::Object(map) => Criteria(map),
            _ => Criteria::default(),
        }
    }
}

/// Sort order for index queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Pagination and ordering options for [`EntityStore::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Option<SortSpec>,
}

/// Abstract durable repository for entity records.
///
/// Implementations must be `Send + Sync`; all methods return owned copies
/// so callers never observe another caller's mutation. The store assigns
/// primary keys on insert.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Persist a new record, assigning its `id`. Returns the stored record.
    async fn insert(&self, kind: EntityKind, record: Record) -> Result<Record>;

    /// Fetch records matching `criteria`, applying sort/skip/limit.
    async fn find(
        &self,
        kind: EntityKind,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<Record>>;

    /// Fetch the first record matching `criteria`, or `None`.
    async fn find_one(&self, kind: EntityKind, criteria: &Criteria) -> Result<Option<Record>>;

    /// Fetch a record by primary key, or `None`.
    async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Record>>;

    /// Merge `changes` (which must carry an `id`) over the stored record
    /// and return the result, or `None` when the id is unknown.
    async fn update(&self, kind: EntityKind, changes: Record) -> Result<Option<Record>>;

    /// Delete a record by primary key. Returns true when the store
    /// acknowledged the operation (whether or not a record existed).
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Count records matching `criteria`, independent of pagination.
    async fn count(&self, kind: EntityKind, criteria: &Criteria) -> Result<u64>;
}
