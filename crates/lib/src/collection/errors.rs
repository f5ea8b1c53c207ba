//! Error types for the collection engine.

use thiserror::Error;

use crate::entity::EntityKind;

/// Errors raised by the generic collection engine.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The operation requires a record id and none was supplied.
    #[error("Missing id for {kind}.{operation}")]
    MissingId {
        kind: EntityKind,
        operation: &'static str,
    },
}

impl CollectionError {
    /// Check if this error indicates a malformed request.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, CollectionError::MissingId { .. })
    }
}
