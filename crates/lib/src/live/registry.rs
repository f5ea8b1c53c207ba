//! Process-wide table of authenticated connections.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Registry of active client sessions, keyed by connection id. Inserted on
/// successful handshake, removed on disconnect; lifetime is bounded by the
/// underlying connection.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, String>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to an authenticated user. Returns the number of
    /// clients now online.
    pub async fn insert(&self, connection_id: &str, user_id: &str) -> usize {
        let mut clients = self.clients.write().await;
        clients.insert(connection_id.to_string(), user_id.to_string());
        clients.len()
    }

    /// Remove a connection, returning the user it was bound to and the
    /// number of clients still online.
    pub async fn remove(&self, connection_id: &str) -> (Option<String>, usize) {
        let mut clients = self.clients.write().await;
        let user = clients.remove(connection_id);
        (user, clients.len())
    }

    pub async fn user_of(&self, connection_id: &str) -> Option<String> {
        self.clients.read().await.get(connection_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}
