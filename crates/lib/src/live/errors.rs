//! Error types for the connection layer.

use thiserror::Error;

/// Errors raised by the hub, room registry, and connection transport.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LiveError {
    /// A room string did not parse as `{kind}:{entityId}`.
    #[error("Invalid subscription")]
    InvalidRoom { room: String },

    /// A room named a kind the hub does not expose.
    #[error("{name} not found")]
    UnknownCollection { name: String },

    /// The connection has not completed a handshake.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Attempted to start a server when one is already running.
    #[error("Server already running on {address}")]
    ServerAlreadyRunning { address: String },

    /// Attempted to stop a server when none is running.
    #[error("Server not running")]
    ServerNotRunning,

    /// Server bind error.
    #[error("Failed to bind server to {address}: {reason}")]
    ServerBind { address: String, reason: String },
}

impl LiveError {
    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LiveError::UnknownCollection { .. })
    }

    /// Check if this error indicates a missing handshake.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, LiveError::NotAuthenticated)
    }

    /// Check if this error indicates a malformed request.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, LiveError::InvalidRoom { .. })
    }
}
