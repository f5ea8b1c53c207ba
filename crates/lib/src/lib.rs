//!
//! Corral: a generic, access-controlled, real-time entity synchronization
//! engine. One engine backs many logical collections with uniform CRUD
//! semantics, tiered access control, and live change propagation to
//! connected clients.
//!
//! ## Core Concepts
//!
//! * **Records (`entity::Record`)**: dynamic JSON documents carrying the base
//!   stamps (`id`, `createdAt`, `updatedAt`, `createdBy`, `updatedBy`).
//! * **Collections (`collection::Collection`)**: the generic engine exposing
//!   create/read/update/delete/index with access enforcement, a staleness
//!   cache, and change broadcasting.
//! * **Access (`access`)**: the ordered capability tiers, per-user collection
//!   scopes, and per-entity Access Control Entries (ACEs).
//! * **Stores (`store::EntityStore`)**: a pluggable durable repository for
//!   records; an in-memory implementation is provided.
//! * **Hub (`live::Hub`)**: the connection multiplexer — client registry,
//!   rooms, handler dispatch, and the subscription protocol.
//! * **Identity (`identity::IdentityProvider`)**: the seam to a third-party
//!   identity provider used by the `discord` handshake.

pub mod access;
pub mod clock;
pub mod collection;
pub mod entity;
pub mod identity;
pub mod live;
pub mod net;
pub mod protocol;
pub mod store;
pub mod users;

pub use access::{AccessContext, AccessLevel, Scopes};
pub use clock::{Clock, SystemClock};
pub use collection::Collection;
pub use entity::{EntityKind, Record};
pub use live::Hub;
pub use protocol::{Envelope, Status};
pub use store::EntityStore;

#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;

/// Result type used throughout the Corral library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Corral library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured access-control errors from the access module
    #[error(transparent)]
    Access(access::AccessError),

    /// Structured store errors from the store module
    #[error(transparent)]
    Store(store::StoreError),

    /// Structured engine errors from the collection module
    #[error(transparent)]
    Collection(collection::CollectionError),

    /// Structured connection-layer errors from the live module
    #[error(transparent)]
    Live(live::LiveError),

    /// Structured identity-provider errors from the identity module
    #[error(transparent)]
    Identity(identity::IdentityError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Access(_) => "access",
            Error::Store(_) => "store",
            Error::Collection(_) => "collection",
            Error::Live(_) => "live",
            Error::Identity(_) => "identity",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_not_found(),
            Error::Live(live_err) => live_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error indicates the caller lacked the required access.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::Live(live_err) => live_err.is_unauthenticated(),
            _ => false,
        }
    }

    /// Check if this error indicates a malformed request.
    pub fn is_invalid_request(&self) -> bool {
        match self {
            Error::Collection(col_err) => col_err.is_invalid_request(),
            Error::Live(live_err) => live_err.is_invalid_request(),
            _ => false,
        }
    }

    /// Check if this error is store/backend-related.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

// Conversion implementations for structured error types
impl From<access::AccessError> for Error {
    fn from(err: access::AccessError) -> Self {
        Error::Access(err)
    }
}

impl From<store::StoreError> for Error {
    fn from(err: store::StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<collection::CollectionError> for Error {
    fn from(err: collection::CollectionError) -> Self {
        Error::Collection(err)
    }
}

impl From<live::LiveError> for Error {
    fn from(err: live::LiveError) -> Self {
        Error::Live(err)
    }
}

impl From<identity::IdentityError> for Error {
    fn from(err: identity::IdentityError) -> Self {
        Error::Identity(err)
    }
}
