//! The connection hub: multiplexes client connections over the collection
//! engine.
//!
//! The hub owns the exposed collection table, the client registry, and the
//! room registry. A connection authenticates through one of the handshake
//! events, which binds its access context and registers collection-level
//! handlers scaled to the caller's resolved access. `sub`/`unsub` manage
//! entity-level handlers and room membership. Everything else dispatches
//! through the connection's handler table; a recognized collection event
//! with no registered handler answers the unauthorized default, fail
//! closed.

mod connection;
mod errors;
mod registry;
mod rooms;

pub use connection::{Connection, Registration};
pub use errors::LiveError;
pub use registry::ClientRegistry;
pub use rooms::{Broadcaster, RoomRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::{AccessContext, AccessLevel, AceStore};
use crate::clock::Clock;
use crate::collection::{Collection, CustomEvent, RoomHook};
use crate::entity::{EntityKind, Record};
use crate::identity::{IdentityProvider, NullIdentity};
use crate::protocol::{
    ClientMessage, Envelope, RequestPayload, ServerMessage, basic_room_name, parse_room,
    room_name,
};
use crate::store::{Criteria, EntityStore};
use crate::users::{AccessRecord, Directory};

/// Default lifetime of an issued session: 30 days.
const DEFAULT_SESSION_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Builder for [`Hub`].
pub struct HubBuilder {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    session_ttl_ms: i64,
    collection_events: Vec<(EntityKind, CustomEvent)>,
    entity_events: Vec<(EntityKind, CustomEvent)>,
    room_hooks: Vec<(EntityKind, Arc<dyn RoomHook>)>,
}

impl HubBuilder {
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn session_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.session_ttl_ms = ttl_ms;
        self
    }

    /// Declare a collection-level extension event for a kind.
    pub fn collection_event(mut self, kind: EntityKind, event: CustomEvent) -> Self {
        self.collection_events.push((kind, event));
        self
    }

    /// Declare an entity-level extension event for a kind.
    pub fn entity_event(mut self, kind: EntityKind, event: CustomEvent) -> Self {
        self.entity_events.push((kind, event));
        self
    }

    /// Attach a room join/leave hook to a kind.
    pub fn room_hook(mut self, kind: EntityKind, hook: Arc<dyn RoomHook>) -> Self {
        self.room_hooks.push((kind, hook));
        self
    }

    pub fn build(self) -> Arc<Hub> {
        let rooms = Arc::new(RoomRegistry::new());
        let clients = Arc::new(ClientRegistry::new());
        let sink = Arc::new(Broadcaster::new(rooms.clone()));
        let ace = Arc::new(AceStore::new(self.store.clone(), self.clock.clone()));

        let build_collection = |kind: EntityKind| {
            let mut builder = Collection::builder(kind, self.store.clone(), self.clock.clone())
                .sink(sink.clone());
            for (event_kind, event) in &self.collection_events {
                if *event_kind == kind {
                    builder = builder.collection_event(event.clone());
                }
            }
            for (event_kind, event) in &self.entity_events {
                if *event_kind == kind {
                    builder = builder.entity_event(event.clone());
                }
            }
            for (hook_kind, hook) in &self.room_hooks {
                if *hook_kind == kind {
                    builder = builder.room_hook(hook.clone());
                }
            }
            builder
        };

        let users = build_collection(EntityKind::User)
            .basic_fields(["name", "image"])
            .ace(ace.clone())
            .build();
        let access = build_collection(EntityKind::Access)
            .ace(ace.clone())
            .ace_parent(EntityKind::User)
            .build();
        let instruments = build_collection(EntityKind::Instrument)
            .basic_fields(["name", "displayName", "type"])
            .ace(ace.clone())
            .cached()
            .build();
        let sessions = build_collection(EntityKind::Session).build();
        let accounts = build_collection(EntityKind::Account).build();

        let directory = Directory::new(
            users.clone(),
            sessions,
            accounts,
            access.clone(),
            ace.clone(),
            self.clock.clone(),
            self.identity,
            self.session_ttl_ms,
        );

        // The collections clients can address: everything else stays
        // internal to the directory.
        let mut collections = HashMap::new();
        collections.insert(EntityKind::User, users);
        collections.insert(EntityKind::Access, access);
        collections.insert(EntityKind::Instrument, instruments);

        Arc::new(Hub {
            collections,
            directory,
            clients,
            rooms,
        })
    }
}

/// The connection multiplexer and subscription manager.
pub struct Hub {
    collections: HashMap<EntityKind, Arc<Collection>>,
    directory: Directory,
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl Hub {
    pub fn builder(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> HubBuilder {
        HubBuilder {
            store,
            clock,
            identity: Arc::new(NullIdentity),
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            collection_events: Vec::new(),
            entity_events: Vec::new(),
            room_hooks: Vec::new(),
        }
    }

    /// An exposed collection by kind.
    pub fn collection(&self, kind: EntityKind) -> Option<&Arc<Collection>> {
        self.collections.get(&kind)
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /*
     * Connection lifecycle
     */

    /// Open a new connection. The transport drains the returned receiver
    /// into the socket.
    pub fn connect(&self) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (conn, rx) = Connection::channel();
        debug!(connection_id = conn.id(), "new connection");
        (conn, rx)
    }

    /// Tear down a connection: leave every room (firing leave hooks) and
    /// drop the client registration.
    pub async fn disconnect(&self, conn: &Connection) {
        let rooms_left = self.rooms.leave_all(conn.id()).await;
        if let Some(ctx) = conn.access().await {
            for room in &rooms_left {
                self.notify_room_left(room, &ctx.user_id);
            }
        }
        let (user, online) = self.clients.remove(conn.id()).await;
        if let Some(user_id) = user {
            info!(user_id = %user_id, online, "disconnected");
        }
    }

    /*
     * Dispatch
     */

    /// Handle one inbound client message and produce its response
    /// envelope. The transport only answers when the message carried a
    /// request id.
    pub async fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        message: &ClientMessage,
    ) -> Envelope<Value> {
        match message.event.as_str() {
            "session" => {
                let token = message.values.get("token").and_then(Value::as_str);
                self.handshake(conn, token, HandshakeFlow::Session).await
            }
            "discord" => {
                let token = message.values.get("token").and_then(Value::as_str);
                self.handshake(conn, token, HandshakeFlow::Identity).await
            }
            "sub" => self.sub(conn, &message.values).await,
            "unsub" => self.unsub(conn, &message.values).await,
            event => self.dispatch_registered(conn, event, &message.values).await,
        }
    }

    async fn dispatch_registered(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        event: &str,
        values: &Value,
    ) -> Envelope<Value> {
        let Some(registration) = conn.registration(event).await else {
            // A collection event the caller was never granted answers the
            // unauthorized default; anything else is simply unknown.
            return if self.recognized_event(event) {
                Envelope::unauthorized()
            } else {
                Envelope::error_message("Unknown event")
            };
        };

        let access = conn.access().await;
        let payload = RequestPayload::from_value(values);

        match registration {
            Registration::Index { kind, read_full } => {
                let criteria = payload.values.map(Criteria::from).unwrap_or_default();
                self.engine(kind)
                    .index_request(criteria, payload.index, access.as_ref(), read_full)
                    .await
                    .into_value()
            }
            Registration::Read { kind, read_full } => {
                let criteria = payload.values.map(Criteria::from).unwrap_or_default();
                self.engine(kind)
                    .read_request(criteria, access.as_ref(), read_full)
                    .await
                    .into_value()
            }
            Registration::Create { kind } => self
                .engine(kind)
                .create_request(payload.values.unwrap_or_default(), access.as_ref())
                .await
                .into_value(),
            Registration::Update { kind } => self
                .engine(kind)
                .update_request(payload.values.unwrap_or_default(), access.as_ref())
                .await
                .into_value(),
            Registration::Delete { kind } => {
                self.engine(kind)
                    .delete_request(payload.values.unwrap_or_default(), access.as_ref())
                    .await
            }
            Registration::Custom { event } => {
                event.handler.handle(values.clone(), access.as_ref()).await
            }
        }
    }

    fn engine(&self, kind: EntityKind) -> &Arc<Collection> {
        // Registrations only ever name exposed collections.
        self.collections
            .get(&kind)
            .expect("registration for unexposed collection")
    }

    /// Whether an event name addresses an exposed collection operation,
    /// registered or not.
    fn recognized_event(&self, event: &str) -> bool {
        let Some((target, op)) = event.rsplit_once('.') else {
            return false;
        };
        let kind_str = target.split(':').next().unwrap_or(target);
        let Some(kind) = EntityKind::parse(kind_str) else {
            return false;
        };
        let Some(collection) = self.collections.get(&kind) else {
            return false;
        };
        matches!(op, "index" | "read" | "create" | "update" | "delete")
            || collection
                .collection_events()
                .iter()
                .chain(collection.entity_events())
                .any(|e| e.name == op)
    }

    /*
     * Handshakes
     */

    async fn handshake(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        token: Option<&str>,
        flow: HandshakeFlow,
    ) -> Envelope<Value> {
        let Some(token) = token else {
            return Envelope::error_message("No token provided");
        };

        let user = match flow {
            HandshakeFlow::Session => self.directory.session_sync(token).await,
            HandshakeFlow::Identity => self.directory.identity_sync(token).await,
        };

        match user {
            Ok(Some(user)) => self.establish(conn, user).await,
            Ok(None) => Envelope::error(),
            Err(e) => {
                warn!(error = %e, "handshake failed");
                Envelope::error()
            }
        }
    }

    /// Bind an authenticated user to the connection: resolve scopes,
    /// register collection listeners, and record the client session.
    async fn establish(self: &Arc<Self>, conn: &Arc<Connection>, user: Record) -> Envelope<Value> {
        let Some(user_id) = user.id().map(str::to_string) else {
            return Envelope::error();
        };

        let access_record = match self.directory.find_or_create_access(&user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Envelope::error(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to resolve access");
                return Envelope::error();
            }
        };

        let scopes = access_record
            .deserialize::<AccessRecord>()
            .map(|a| a.scopes)
            .unwrap_or_default();
        let ctx = AccessContext::new(user_id.clone(), scopes);
        conn.set_access(ctx.clone()).await;

        for collection in self.collections.values() {
            self.add_collection_listeners(collection, conn, &ctx).await;
        }

        let online = self.clients.insert(conn.id(), &user_id).await;
        info!(
            user = user.get_str("name").unwrap_or("unknown"),
            user_id = %user_id,
            online,
            "subscribed"
        );

        Envelope::ok("Session established", access_record.to_value())
    }

    /*
     * Listener registration
     */

    /// Register collection-level handlers scaled to the caller's resolved
    /// access. Tiers are exclusive: a caller holds exactly one
    /// `index`/`read` registration, basic at exactly `ReadBasic`, full
    /// from `ReadFull` up.
    async fn add_collection_listeners(
        &self,
        collection: &Arc<Collection>,
        conn: &Arc<Connection>,
        ctx: &AccessContext,
    ) {
        let highest = collection.highest_access(Some(ctx), None).await;
        if highest == AccessLevel::None {
            return;
        }
        let kind = collection.kind();

        if highest == AccessLevel::ReadBasic {
            conn.register(
                format!("{kind}.index"),
                Registration::Index {
                    kind,
                    read_full: false,
                },
            )
            .await;
            conn.register(
                format!("{kind}.read"),
                Registration::Read {
                    kind,
                    read_full: false,
                },
            )
            .await;
        }
        if highest >= AccessLevel::ReadFull {
            conn.register(
                format!("{kind}.index"),
                Registration::Index {
                    kind,
                    read_full: true,
                },
            )
            .await;
            conn.register(
                format!("{kind}.read"),
                Registration::Read {
                    kind,
                    read_full: true,
                },
            )
            .await;
        }
        if highest >= AccessLevel::CreateEntity {
            conn.register(format!("{kind}.create"), Registration::Create { kind })
                .await;
            conn.register(format!("{kind}.delete"), Registration::Delete { kind })
                .await;
        }

        for event in collection.collection_events() {
            if event.required > highest {
                continue;
            }
            conn.register(
                format!("{kind}.{}", event.name),
                Registration::Custom {
                    event: event.clone(),
                },
            )
            .await;
        }
    }

    /// Register entity-level handlers for one subscription and join the
    /// matching room. Returns the resolved level for the response message.
    async fn add_entity_listeners(
        &self,
        collection: &Arc<Collection>,
        conn: &Arc<Connection>,
        ctx: &AccessContext,
        entity_id: &str,
    ) -> AccessLevel {
        let highest = collection.highest_access(Some(ctx), Some(entity_id)).await;
        if highest == AccessLevel::None {
            return highest;
        }
        let kind = collection.kind();
        let room = room_name(kind, entity_id);

        if highest == AccessLevel::ReadBasic {
            conn.register(
                format!("{room}.read"),
                Registration::Read {
                    kind,
                    read_full: false,
                },
            )
            .await;
            if self
                .rooms
                .join(basic_room_name(kind, entity_id), conn.id(), conn.sender())
                .await
            {
                self.notify_room_joined(collection, entity_id, &ctx.user_id);
            }
        }
        if highest >= AccessLevel::ReadFull {
            conn.register(
                format!("{room}.read"),
                Registration::Read {
                    kind,
                    read_full: true,
                },
            )
            .await;
            if self.rooms.join(room.clone(), conn.id(), conn.sender()).await {
                self.notify_room_joined(collection, entity_id, &ctx.user_id);
            }
        }
        if highest >= AccessLevel::ModerateEntity {
            conn.register(format!("{room}.update"), Registration::Update { kind })
                .await;
        }

        for event in collection.entity_events() {
            if event.required > highest {
                continue;
            }
            conn.register(
                format!("{room}.{}", event.name),
                Registration::Custom {
                    event: event.clone(),
                },
            )
            .await;
        }

        highest
    }

    /// Remove every entity-level handler for a room and leave both room
    /// variants, regardless of which tier the caller held.
    async fn remove_entity_listeners(
        &self,
        collection: &Arc<Collection>,
        conn: &Arc<Connection>,
        ctx: &AccessContext,
        entity_id: &str,
    ) {
        let kind = collection.kind();
        let room = room_name(kind, entity_id);

        conn.deregister(&format!("{room}.read")).await;
        conn.deregister(&format!("{room}.update")).await;
        for event in collection.entity_events() {
            conn.deregister(&format!("{room}.{}", event.name)).await;
        }

        if self.rooms.leave(&room, conn.id()).await {
            self.notify_room_left(&room, &ctx.user_id);
        }
        let basic = basic_room_name(kind, entity_id);
        if self.rooms.leave(&basic, conn.id()).await {
            self.notify_room_left(&basic, &ctx.user_id);
        }
    }

    /*
     * Subscriptions
     */

    async fn sub(self: &Arc<Self>, conn: &Arc<Connection>, values: &Value) -> Envelope<Value> {
        let Some(ctx) = conn.access().await else {
            return Envelope::error();
        };
        let res = match self.resolve_room(values) {
            Err(e) => Envelope::error_message(e.to_string()),
            Ok((collection, entity_id)) => {
                let highest = self
                    .add_entity_listeners(&collection, conn, &ctx, &entity_id)
                    .await;
                let mut res = Envelope::error();
                res.status.code = 200;
                res.status.message = format!("Subscribed as {}", highest.label());
                res
            }
        };
        res.status.log("sub", None);
        res
    }

    async fn unsub(self: &Arc<Self>, conn: &Arc<Connection>, values: &Value) -> Envelope<Value> {
        let Some(ctx) = conn.access().await else {
            return Envelope::error();
        };
        let res = match self.resolve_room(values) {
            Err(e) => Envelope::error_message(e.to_string()),
            Ok((collection, entity_id)) => {
                self.remove_entity_listeners(&collection, conn, &ctx, &entity_id)
                    .await;
                let mut res = Envelope::error();
                res.status.code = 200;
                res.status.message = "Unsubscribed".to_string();
                res
            }
        };
        res.status.log("unsub", None);
        res
    }

    /// Resolve a `sub`/`unsub` payload to an exposed collection and entity
    /// id. The payload is the room string, either bare or as `{room}`.
    fn resolve_room(&self, values: &Value) -> Result<(Arc<Collection>, String), LiveError> {
        let room = values
            .as_str()
            .or_else(|| values.get("room").and_then(Value::as_str))
            .unwrap_or_default();

        let mut parts = room.splitn(3, ':');
        let kind_str = parts.next().unwrap_or_default();
        let entity_id = parts.next().unwrap_or_default();
        if kind_str.is_empty() || entity_id.is_empty() {
            return Err(LiveError::InvalidRoom {
                room: room.to_string(),
            });
        }

        let collection = EntityKind::parse(kind_str)
            .and_then(|kind| self.collections.get(&kind))
            .ok_or_else(|| LiveError::UnknownCollection {
                name: kind_str.to_string(),
            })?;
        Ok((collection.clone(), entity_id.to_string()))
    }

    /*
     * Room hooks
     */

    fn notify_room_joined(&self, collection: &Arc<Collection>, entity_id: &str, user_id: &str) {
        if let Some(hook) = collection.room_hook() {
            hook.joined(entity_id, user_id);
        }
    }

    fn notify_room_left(&self, room: &str, user_id: &str) {
        let Some((kind, entity_id)) = parse_room(room) else {
            return;
        };
        let Some(collection) = self.collections.get(&kind) else {
            return;
        };
        if let Some(hook) = collection.room_hook() {
            hook.left(entity_id, user_id);
        }
    }
}

enum HandshakeFlow {
    Session,
    Identity,
}
