//! Room membership and change broadcasting.
//!
//! A room is a derived, non-persistent relation between connections and
//! one entity: `{kind}:{id}` for full payloads, `{kind}:{id}:basic` for
//! redacted ones. Membership holds a clone of the connection's outbound
//! sender, so emitting never consults the client registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::collection::ChangeSink;
use crate::entity::{EntityKind, Record};
use crate::protocol::{ServerMessage, basic_room_name, room_name};

/// Registry of rooms and their member connections.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a connection to a room. Returns true when the connection was
    /// not already a member.
    pub async fn join(
        &self,
        room: impl Into<String>,
        connection_id: &str,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        let room = room.into();
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.clone()).or_default();
        let joined = members.insert(connection_id.to_string(), sender).is_none();
        if joined {
            trace!(room = %room, connection_id, "joined room");
        }
        joined
    }

    /// Remove a connection from a room. Returns true when it was a member.
    /// Leaving a never-joined room is a no-op.
    pub async fn leave(&self, room: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let left = members.remove(connection_id).is_some();
        if members.is_empty() {
            rooms.remove(room);
        }
        if left {
            trace!(room, connection_id, "left room");
        }
        left
    }

    /// Remove a connection from every room, returning the rooms it left.
    pub async fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|room, members| {
            if members.remove(connection_id).is_some() {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Emit a payload to every member of a room, using the room name as
    /// the event name. Best-effort: closed connections are skipped.
    /// Returns the number of queued deliveries.
    pub async fn emit(&self, room: &str, values: Value) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for sender in members.values() {
            let message = ServerMessage::Event {
                event: room.to_string(),
                values: values.clone(),
            };
            if sender.send(message).is_ok() {
                delivered += 1;
            }
        }
        debug!(room, delivered, "broadcast");
        delivered
    }

    /// Current member count of a room. Test/diagnostic helper.
    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

/// The change broadcaster: pushes mutated records into the entity's rooms.
/// Delivery is fire-and-forget from the engine's perspective.
pub struct Broadcaster {
    rooms: Arc<RoomRegistry>,
}

impl Broadcaster {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }
}

impl ChangeSink for Broadcaster {
    fn emit_changes(&self, kind: EntityKind, full: &Record, basic: Option<&Record>) {
        let Some(id) = full.id().map(str::to_string) else {
            return;
        };
        let rooms = self.rooms.clone();
        let room = room_name(kind, &id);
        let basic_room = basic_room_name(kind, &id);
        let full = full.to_value();
        let basic = basic.map(Record::to_value);

        tokio::spawn(async move {
            rooms.emit(&room, full).await;
            if let Some(basic) = basic {
                rooms.emit(&basic_room, basic).await;
            }
        });
    }
}
