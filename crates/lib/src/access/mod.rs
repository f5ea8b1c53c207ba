//! Access control: capability tiers, per-user collection scopes, and
//! per-entity Access Control Entries.
//!
//! A caller's effective access to an entity is the combination of two
//! layers: the collection-wide scope from their [`Scopes`] map, and any
//! entity-level grant recorded in that entity's ACE. The resolver itself
//! lives on [`crate::Collection`], which owns the ACE wiring.

mod ace;
mod errors;

pub use ace::{Ace, AceStore, GrantLists};
pub use errors::AccessError;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;

/// Ordered capability tiers, lowest to highest.
///
/// Comparisons use this total order, not set membership: `CreateEntity`
/// implies everything `ReadFull` allows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum AccessLevel {
    #[default]
    None,
    ReadBasic,
    ReadFull,
    CreateEntity,
    ModerateEntity,
}

impl AccessLevel {
    /// Every level, lowest to highest.
    pub const ALL: [AccessLevel; 5] = [
        AccessLevel::None,
        AccessLevel::ReadBasic,
        AccessLevel::ReadFull,
        AccessLevel::CreateEntity,
        AccessLevel::ModerateEntity,
    ];

    /// Position of this level in the order; also indexes ACE grant lists.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Inverse of [`AccessLevel::index`].
    pub fn from_index(index: usize) -> Option<AccessLevel> {
        AccessLevel::ALL.get(index).copied()
    }

    /// Human-readable label shown in response envelopes.
    pub fn label(&self) -> &'static str {
        match self {
            AccessLevel::None => "No access",
            AccessLevel::ReadBasic => "Viewer (basic)",
            AccessLevel::ReadFull => "Viewer(full)",
            AccessLevel::CreateEntity => "Creator",
            AccessLevel::ModerateEntity => "Moderator",
        }
    }

    /// Iterate levels from `self` up to `ModerateEntity`, ascending.
    pub fn and_above(&self) -> impl Iterator<Item = AccessLevel> {
        AccessLevel::ALL.into_iter().skip(self.index())
    }
}

/// Per-user mapping from collection kind to baseline access level.
pub type Scopes = HashMap<EntityKind, AccessLevel>;

/// The resolved identity of an authenticated caller: who they are and what
/// their collection-level scopes are. Bound to a connection at handshake
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessContext {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub scopes: Scopes,
}

impl AccessContext {
    pub fn new(user_id: impl Into<String>, scopes: Scopes) -> Self {
        Self {
            user_id: user_id.into(),
            scopes,
        }
    }

    /// The caller's baseline level for a collection, `None` when the kind
    /// is absent from the scope map.
    pub fn scope_for(&self, kind: EntityKind) -> AccessLevel {
        self.scopes.get(&kind).copied().unwrap_or_default()
    }
}
