//! Access Control Entries: per-entity grant lists layered atop collection
//! scopes.

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{AccessError, AccessLevel};
use crate::Result;
use crate::clock::Clock;
use crate::entity::{EntityKind, Record, SYSTEM_USER};
use crate::store::{Criteria, EntityStore};

/// Five ordered lists of user ids, one per access level. A user present in
/// the list for a level holds exactly that tier for the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantLists([Vec<String>; 5]);

impl GrantLists {
    /// Empty lists at every level.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Empty lists except a single `ModerateEntity` grant. Used when a new
    /// entity's ACE is initialized for its creator.
    pub fn with_moderator(user_id: impl Into<String>) -> Self {
        let mut lists = Self::default();
        lists[AccessLevel::ModerateEntity].push(user_id.into());
        lists
    }

    /// Whether `user_id` is granted exactly `level`.
    pub fn contains(&self, level: AccessLevel, user_id: &str) -> bool {
        self[level].iter().any(|u| u == user_id)
    }

    /// Add `user_id` at `level` if not already present. Returns true when
    /// the lists changed.
    pub fn add(&mut self, level: AccessLevel, user_id: &str) -> bool {
        if self.contains(level, user_id) {
            return false;
        }
        self[level].push(user_id.to_string());
        true
    }
}

impl Index<AccessLevel> for GrantLists {
    type Output = Vec<String>;

    fn index(&self, level: AccessLevel) -> &Vec<String> {
        &self.0[level.index()]
    }
}

impl IndexMut<AccessLevel> for GrantLists {
    fn index_mut(&mut self, level: AccessLevel) -> &mut Vec<String> {
        &mut self.0[level.index()]
    }
}

/// One Access Control Entry: the grant lists for a single entity of a
/// single kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ace {
    /// Primary key of the ACE record itself (absent until persisted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "entityKind")]
    pub entity_kind: EntityKind,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(default)]
    pub grants: GrantLists,
}

/// Dedicated repository for ACE records, keyed by (kind, entity id).
///
/// Entries are created lazily: looking up an entity with no ACE persists an
/// empty one, so subsequent scans are a single read.
pub struct AceStore {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
}

impl AceStore {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fetch the ACE for (`kind`, `entity_id`), creating it when absent.
    /// `default` seeds the grant lists of a newly created entry; an
    /// existing entry is returned as stored and the default is ignored.
    pub async fn lookup(
        &self,
        kind: EntityKind,
        entity_id: &str,
        default: Option<GrantLists>,
    ) -> Result<Ace> {
        let criteria = Criteria::from_pairs([
            ("entityKind", json!(kind)),
            ("entityId", json!(entity_id)),
        ]);
        if let Some(record) = self.store.find_one(EntityKind::Ace, &criteria).await? {
            return Self::decode(kind, entity_id, &record);
        }

        let ace = Ace {
            id: None,
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            grants: default.unwrap_or_default(),
        };
        let mut record = Record::from_serialize(&ace)?;
        record.stamp_created(self.clock.now_millis(), SYSTEM_USER);
        let created = self.store.insert(EntityKind::Ace, record).await?;
        debug!(kind = %kind, entity_id, "initialized ace");
        Self::decode(kind, entity_id, &created)
    }

    /// Ensure `user_id` holds at least an explicit `level` grant for the
    /// entity, persisting the change when the lists are updated.
    pub async fn ensure_grant(
        &self,
        kind: EntityKind,
        entity_id: &str,
        level: AccessLevel,
        user_id: &str,
    ) -> Result<Ace> {
        let mut ace = self.lookup(kind, entity_id, None).await?;
        if !ace.grants.add(level, user_id) {
            return Ok(ace);
        }

        let Some(ace_id) = ace.id.clone() else {
            return Err(AccessError::AceInitFailed {
                kind,
                entity_id: entity_id.to_string(),
            }
            .into());
        };
        let mut changes = Record::new();
        changes.set_id(ace_id);
        changes.set("grants", serde_json::to_value(&ace.grants)?);
        changes.stamp_updated(self.clock.now_millis(), SYSTEM_USER);
        self.store.update(EntityKind::Ace, changes).await?;
        Ok(ace)
    }

    fn decode(kind: EntityKind, entity_id: &str, record: &Record) -> Result<Ace> {
        record
            .deserialize::<Ace>()
            .map_err(|e| {
                AccessError::CorruptAce {
                    kind,
                    entity_id: entity_id.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
    }
}
