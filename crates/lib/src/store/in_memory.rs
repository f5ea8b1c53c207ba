//! In-memory entity store.
//!
//! Backs tests and ephemeral deployments. Records live in per-kind maps
//! keyed by id; all methods return owned copies. Unsorted queries come
//! back in id order, which is stable but not meaningful — callers that
//! care about order pass a sort.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Criteria, EntityStore, FindOptions, StoreError};
use crate::Result;
use crate::entity::{EntityKind, Record};

/// An in-memory [`EntityStore`] over `RwLock`'d per-kind maps.
#[derive(Default)]
pub struct InMemory {
    collections: RwLock<HashMap<EntityKind, BTreeMap<String, Record>>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for a kind. Test/diagnostic helper.
    pub async fn len(&self, kind: EntityKind) -> usize {
        let collections = self.collections.read().await;
        collections.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    pub async fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind).await == 0
    }
}

/// Order JSON values for sorting: null < booleans < numbers < strings <
/// everything else (by serialized form). Missing fields sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[async_trait]
impl EntityStore for InMemory {
    async fn insert(&self, kind: EntityKind, mut record: Record) -> Result<Record> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(kind).or_default();

        let id = match record.id() {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                record.set_id(id.clone());
                id
            }
        };
        if entries.contains_key(&id) {
            return Err(StoreError::Backend {
                kind,
                reason: format!("duplicate id {id}"),
            }
            .into());
        }
        entries.insert(id, record.clone());
        Ok(record)
    }

    async fn find(
        &self,
        kind: EntityKind,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<Record>> {
        let collections = self.collections.read().await;
        let mut matches: Vec<Record> = collections
            .get(&kind)
            .map(|entries| {
                entries
                    .values()
                    .filter(|r| criteria.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = &options.sort {
            matches.sort_by(|a, b| {
                let ordering = compare_values(a.get(&sort.field), b.get(&sort.field));
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let skipped = matches.into_iter().skip(options.skip);
        Ok(match options.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        })
    }

    async fn find_one(&self, kind: EntityKind, criteria: &Criteria) -> Result<Option<Record>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&kind)
            .and_then(|entries| entries.values().find(|r| criteria.matches(r)).cloned()))
    }

    async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Record>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&kind)
            .and_then(|entries| entries.get(id).cloned()))
    }

    async fn update(&self, kind: EntityKind, changes: Record) -> Result<Option<Record>> {
        let Some(id) = changes.id().map(str::to_string) else {
            return Err(StoreError::Backend {
                kind,
                reason: "update without id".to_string(),
            }
            .into());
        };
        let mut collections = self.collections.write().await;
        let Some(stored) = collections
            .get_mut(&kind)
            .and_then(|entries| entries.get_mut(&id))
        else {
            return Ok(None);
        };
        stored.merge(&changes);
        Ok(Some(stored.clone()))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        if let Some(entries) = collections.get_mut(&kind) {
            entries.remove(id);
        }
        // Acknowledged whether or not a record existed, mirroring
        // delete-one semantics of document stores.
        Ok(true)
    }

    async fn count(&self, kind: EntityKind, criteria: &Criteria) -> Result<u64> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&kind)
            .map(|entries| entries.values().filter(|r| criteria.matches(r)).count() as u64)
            .unwrap_or(0))
    }
}
