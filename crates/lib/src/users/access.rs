//! Per-user scope records.

use serde::{Deserialize, Serialize};

use crate::access::{AccessLevel, Scopes};
use crate::entity::EntityKind;

/// The persisted shape of a user's scope record: one access level per
/// collection kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub scopes: Scopes,
}

/// Baseline scopes granted to every authenticated user. Exhaustive over
/// the kinds so a raised default reaches existing users through scope
/// migration.
pub fn default_scopes() -> Scopes {
    let mut scopes = Scopes::new();
    for kind in EntityKind::ALL {
        let level = match kind {
            EntityKind::User => AccessLevel::ReadBasic,
            EntityKind::Instrument => AccessLevel::ReadBasic,
            EntityKind::Session
            | EntityKind::Account
            | EntityKind::Access
            | EntityKind::Ace => AccessLevel::None,
        };
        scopes.insert(kind, level);
    }
    scopes
}
