//! Error types for the access module.

use thiserror::Error;

use crate::entity::EntityKind;

/// Errors raised while resolving access or maintaining ACEs.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AccessError {
    /// A stored ACE record could not be decoded into its fixed shape.
    #[error("Corrupt ACE for {kind}:{entity_id}: {reason}")]
    CorruptAce {
        kind: EntityKind,
        entity_id: String,
        reason: String,
    },

    /// The ACE store failed to persist a lazily created entry.
    #[error("Failed to initialize ACE for {kind}:{entity_id}")]
    AceInitFailed { kind: EntityKind, entity_id: String },
}

impl AccessError {
    /// Check if this error indicates corrupt persisted access data.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, AccessError::CorruptAce { .. })
    }
}
