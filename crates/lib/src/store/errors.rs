//! Error types for the store module.

use thiserror::Error;

use crate::entity::EntityKind;

/// Errors raised by durable store implementations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id exists in the collection.
    #[error("Record not found in {kind}: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// The backing store rejected or failed an operation.
    #[error("Store failure in {kind}: {reason}")]
    Backend { kind: EntityKind, reason: String },

    /// A stored record could not be encoded or decoded.
    #[error("Serialization failure in {kind}: {reason}")]
    Serialization { kind: EntityKind, reason: String },
}

impl StoreError {
    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Check if this error is a backend failure.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }
}
