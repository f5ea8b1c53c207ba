//! A single client connection: its outbound channel, its access context,
//! and the dispatch table of event handlers registered for it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::access::AccessContext;
use crate::collection::CustomEvent;
use crate::entity::EntityKind;
use crate::protocol::ServerMessage;

/// What a registered event name dispatches to. Registrations encode the
/// access tier they were granted with (`read_full`); the engine trusts
/// them on every call.
#[derive(Clone)]
pub enum Registration {
    Index { kind: EntityKind, read_full: bool },
    Read { kind: EntityKind, read_full: bool },
    Create { kind: EntityKind },
    Update { kind: EntityKind },
    Delete { kind: EntityKind },
    Custom { event: CustomEvent },
}

/// Handle to one live connection.
///
/// The handler table and access context live behind locks because inbound
/// dispatch, handshakes, and subscription changes run as independent
/// tasks.
pub struct Connection {
    id: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    access: RwLock<Option<AccessContext>>,
    handlers: RwLock<HashMap<String, Registration>>,
}

impl Connection {
    /// Create a connection handle and the receiving end of its outbound
    /// channel, which the transport drains into the socket.
    pub fn channel() -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id: Uuid::new_v4().to_string(),
            outbound: tx,
            access: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The outbound sender, cloned into room memberships.
    pub fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.outbound.clone()
    }

    /// Queue a message for the client. Best-effort: a closed transport
    /// drops the message.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    pub async fn access(&self) -> Option<AccessContext> {
        self.access.read().await.clone()
    }

    pub async fn set_access(&self, context: AccessContext) {
        *self.access.write().await = Some(context);
    }

    pub async fn register(&self, event: impl Into<String>, registration: Registration) {
        self.handlers.write().await.insert(event.into(), registration);
    }

    pub async fn registration(&self, event: &str) -> Option<Registration> {
        self.handlers.read().await.get(event).cloned()
    }

    pub async fn deregister(&self, event: &str) {
        self.handlers.write().await.remove(event);
    }

    /// Number of registered handlers. Test/diagnostic helper.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether an event name has a registered handler.
    pub async fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().await.contains_key(event)
    }
}
