use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use corral::{
    AccessContext, AccessLevel, EntityKind, Envelope, FixedClock, Hub, Record,
    collection::{CustomEvent, EventHandler, RoomHook},
    protocol::ServerMessage,
};

use super::helpers::{
    CountingStore, assert_no_event, create_user, dispatch, login, recv_event, set_scope, setup,
};

async fn seed_instrument(hub: &Arc<Hub>) -> Record {
    let instruments = hub.collection(EntityKind::Instrument).unwrap();
    let mut values = Record::new();
    values.set("name", "EUR_USD");
    values.set("displayName", "EUR/USD");
    values.set("type", "CURRENCY");
    values.set("marginRate", 0.02);
    instruments.create(values, None).await.unwrap()
}

#[tokio::test]
async fn handshake_returns_the_scope_record() {
    let fx = setup();
    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();

    let (token, _) = fx.hub.directory().issue_session(&user_id).await.unwrap();
    let (conn, _rx) = fx.hub.connect();
    let res = dispatch(&fx.hub, &conn, "session", json!({ "token": token })).await;

    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Session established");
    let values = res.values.unwrap();
    assert_eq!(values["userId"], user_id);
    assert_eq!(values["scopes"]["user"], "ReadBasic");
    assert_eq!(values["scopes"]["instrument"], "ReadBasic");
    assert_eq!(values["scopes"]["ace"], "None");

    assert_eq!(fx.hub.clients().count().await, 1);
}

#[tokio::test]
async fn handshake_failures_use_the_default_envelope() {
    let fx = setup();
    let (conn, _rx) = fx.hub.connect();

    let res = dispatch(&fx.hub, &conn, "session", json!({})).await;
    assert_eq!(res.status.code, 500);
    assert_eq!(res.status.message, "No token provided");

    let res = dispatch(&fx.hub, &conn, "session", json!({ "token": "bogus" })).await;
    assert_eq!(res.status.code, 500);
    assert_eq!(res.status.message, "Error");
    assert_eq!(fx.hub.clients().count().await, 0);
}

#[tokio::test]
async fn listener_tiers_are_exclusive() {
    let fx = setup();
    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&fx.hub, &user_id).await;

    // Default scopes: user and instrument at ReadBasic, the rest at None.
    // Exactly one read/index registration per readable collection, and no
    // create/delete handlers. The access collection rides its ACE parent
    // (user), so it registers at the basic tier too.
    assert!(conn.has_handler("instrument.read").await);
    assert!(conn.has_handler("instrument.index").await);
    assert!(conn.has_handler("user.read").await);
    assert!(conn.has_handler("user.index").await);
    assert!(conn.has_handler("access.read").await);
    assert!(!conn.has_handler("instrument.create").await);
    assert!(!conn.has_handler("instrument.delete").await);
    assert!(!conn.has_handler("access.create").await);
    assert_eq!(conn.handler_count().await, 6);
}

#[tokio::test]
async fn unregistered_collection_events_fail_closed() {
    let fx = setup();
    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&fx.hub, &user_id).await;

    // Recognized operation the caller was never granted.
    let res = dispatch(&fx.hub, &conn, "instrument.create", json!({})).await;
    assert_eq!(res.status.code, 403);
    assert_eq!(res.status.message, "Unauthorized");

    // Unknown operation and unknown kind.
    let res = dispatch(&fx.hub, &conn, "instrument.bogus", json!({})).await;
    assert_eq!(res.status.code, 500);
    assert_eq!(res.status.message, "Unknown event");
    let res = dispatch(&fx.hub, &conn, "widget.read", json!({})).await;
    assert_eq!(res.status.message, "Unknown event");
}

#[tokio::test]
async fn dispatched_reads_respect_the_registered_tier() {
    let fx = setup();
    let instrument = seed_instrument(&fx.hub).await;
    let alice = create_user(&fx.hub, "alice").await;
    let alice_id = alice.id().unwrap().to_string();
    let bob = create_user(&fx.hub, "bob").await;
    let bob_id = bob.id().unwrap().to_string();
    set_scope(&fx.hub, &bob_id, EntityKind::Instrument, AccessLevel::ReadFull).await;

    let payload = json!({ "values": { "id": instrument.id().unwrap() } });

    let (alice_conn, _rx) = login(&fx.hub, &alice_id).await;
    let res = dispatch(&fx.hub, &alice_conn, "instrument.read", payload.clone()).await;
    assert_eq!(res.status.code, 200);
    let record = res.values.unwrap();
    assert_eq!(record["name"], "EUR_USD");
    assert!(record.get("marginRate").is_none(), "basic tier must be redacted");

    let (bob_conn, _rx) = login(&fx.hub, &bob_id).await;
    let res = dispatch(&fx.hub, &bob_conn, "instrument.read", payload).await;
    assert_eq!(res.values.unwrap()["marginRate"], json!(0.02));
}

#[tokio::test]
async fn subscribe_tiers_join_matching_rooms_and_broadcasts_split() {
    let fx = setup();
    let instrument = seed_instrument(&fx.hub).await;
    let entity_id = instrument.id().unwrap().to_string();
    let room = format!("instrument:{entity_id}");
    let basic_room = format!("{room}:basic");

    // alice holds the default ReadBasic scope; bob moderates instruments.
    let alice = create_user(&fx.hub, "alice").await;
    let alice_id = alice.id().unwrap().to_string();
    let bob = create_user(&fx.hub, "bob").await;
    let bob_id = bob.id().unwrap().to_string();
    set_scope(
        &fx.hub,
        &bob_id,
        EntityKind::Instrument,
        AccessLevel::ModerateEntity,
    )
    .await;

    let (alice_conn, mut alice_rx) = login(&fx.hub, &alice_id).await;
    let res = dispatch(&fx.hub, &alice_conn, "sub", json!(room.clone())).await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Subscribed as Viewer (basic)");
    assert_eq!(fx.hub.rooms().member_count(&basic_room).await, 1);
    assert_eq!(fx.hub.rooms().member_count(&room).await, 0);
    assert!(alice_conn.has_handler(&format!("{room}.read")).await);
    assert!(!alice_conn.has_handler(&format!("{room}.update")).await);

    let (bob_conn, mut bob_rx) = login(&fx.hub, &bob_id).await;
    let res = dispatch(&fx.hub, &bob_conn, "sub", json!(room.clone())).await;
    assert_eq!(res.status.message, "Subscribed as Moderator");
    assert_eq!(fx.hub.rooms().member_count(&room).await, 1);
    assert!(bob_conn.has_handler(&format!("{room}.update")).await);

    // Bob mutates the entity through his entity-level handler.
    let res = dispatch(
        &fx.hub,
        &bob_conn,
        &format!("{room}.update"),
        json!({ "values": { "id": entity_id, "marginRate": 0.09 } }),
    )
    .await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Updated");

    // Full payload to the full room, redacted payload to the basic room.
    match recv_event(&mut bob_rx).await {
        ServerMessage::Event { event, values } => {
            assert_eq!(event, room);
            assert_eq!(values["marginRate"], json!(0.09));
            assert_eq!(values["updatedBy"], json!(bob_id.clone()));
        }
        other => panic!("expected broadcast, got {other:?}"),
    }
    match recv_event(&mut alice_rx).await {
        ServerMessage::Event { event, values } => {
            assert_eq!(event, basic_room);
            assert_eq!(values["name"], "EUR_USD");
            assert!(values.get("marginRate").is_none(), "basic room sees redacted data");
        }
        other => panic!("expected broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn creator_moderates_via_ace_end_to_end() {
    let fx = setup();
    let alice = create_user(&fx.hub, "alice").await;
    let alice_id = alice.id().unwrap().to_string();
    set_scope(
        &fx.hub,
        &alice_id,
        EntityKind::Instrument,
        AccessLevel::CreateEntity,
    )
    .await;

    let (conn, _rx) = login(&fx.hub, &alice_id).await;
    let res = dispatch(
        &fx.hub,
        &conn,
        "instrument.create",
        json!({ "values": { "name": "GBP_USD", "marginRate": 0.03 } }),
    )
    .await;
    assert_eq!(res.status.code, 200);
    let created = res.values.unwrap();
    let entity_id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["createdBy"], json!(alice_id.clone()));

    // The creation ACE raises the creator to Moderator on this entity.
    let res = dispatch(&fx.hub, &conn, "sub", json!(format!("instrument:{entity_id}"))).await;
    assert_eq!(res.status.message, "Subscribed as Moderator");

    // Another default-scope caller only reaches the basic tier.
    let bob = create_user(&fx.hub, "bob").await;
    let bob_id = bob.id().unwrap().to_string();
    let (bob_conn, _rx) = login(&fx.hub, &bob_id).await;
    let res = dispatch(&fx.hub, &bob_conn, "sub", json!(format!("instrument:{entity_id}"))).await;
    assert_eq!(res.status.message, "Subscribed as Viewer (basic)");

    let res = dispatch(
        &fx.hub,
        &bob_conn,
        "instrument.read",
        json!({ "values": { "id": entity_id } }),
    )
    .await;
    assert!(res.values.unwrap().get("marginRate").is_none());
}

#[tokio::test]
async fn subscribe_rejects_malformed_and_unknown_rooms() {
    let fx = setup();
    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&fx.hub, &user_id).await;

    let res = dispatch(&fx.hub, &conn, "sub", json!("garbage")).await;
    assert_eq!(res.status.code, 500);
    assert_eq!(res.status.message, "Invalid subscription");

    let res = dispatch(&fx.hub, &conn, "sub", json!("widget:abc")).await;
    assert_eq!(res.status.message, "widget not found");

    // A real kind that is not exposed to clients reads the same way.
    let res = dispatch(&fx.hub, &conn, "sub", json!("session:abc")).await;
    assert_eq!(res.status.message, "session not found");
}

#[tokio::test]
async fn subscribe_without_access_joins_nothing() {
    let fx = setup();
    let instrument = seed_instrument(&fx.hub).await;
    let room = format!("instrument:{}", instrument.id().unwrap());

    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    set_scope(&fx.hub, &user_id, EntityKind::Instrument, AccessLevel::None).await;
    let (conn, _rx) = login(&fx.hub, &user_id).await;

    let res = dispatch(&fx.hub, &conn, "sub", json!(room.clone())).await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Subscribed as No access");
    assert_eq!(fx.hub.rooms().member_count(&room).await, 0);
    assert_eq!(fx.hub.rooms().member_count(&format!("{room}:basic")).await, 0);
}

#[tokio::test]
async fn unsubscribe_is_idempotent_and_removes_listeners() {
    let fx = setup();
    let instrument = seed_instrument(&fx.hub).await;
    let entity_id = instrument.id().unwrap().to_string();
    let room = format!("instrument:{entity_id}");

    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, mut rx) = login(&fx.hub, &user_id).await;

    // Unsubscribing from a never-joined room succeeds.
    let res = dispatch(&fx.hub, &conn, "unsub", json!(room.clone())).await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Unsubscribed");

    dispatch(&fx.hub, &conn, "sub", json!(room.clone())).await;
    assert!(conn.has_handler(&format!("{room}.read")).await);

    let res = dispatch(&fx.hub, &conn, "unsub", json!(room.clone())).await;
    assert_eq!(res.status.code, 200);
    assert!(!conn.has_handler(&format!("{room}.read")).await);
    assert_eq!(fx.hub.rooms().member_count(&format!("{room}:basic")).await, 0);

    // And again, for idempotence.
    let res = dispatch(&fx.hub, &conn, "unsub", json!(room.clone())).await;
    assert_eq!(res.status.code, 200);

    // No broadcast reaches the caller after unsubscribing.
    let instruments = fx.hub.collection(EntityKind::Instrument).unwrap();
    let mut changes = Record::new();
    changes.set_id(&entity_id);
    changes.set("marginRate", 0.5);
    instruments.update_request(changes, None).await;
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn disconnect_clears_rooms_and_registry() {
    let fx = setup();
    let instrument = seed_instrument(&fx.hub).await;
    let room = format!("instrument:{}", instrument.id().unwrap());

    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&fx.hub, &user_id).await;
    dispatch(&fx.hub, &conn, "sub", json!(room.clone())).await;
    assert_eq!(fx.hub.rooms().member_count(&format!("{room}:basic")).await, 1);

    fx.hub.disconnect(&conn).await;
    assert_eq!(fx.hub.clients().count().await, 0);
    assert_eq!(fx.hub.rooms().member_count(&format!("{room}:basic")).await, 0);
}

/// Room hook that records joins and leaves.
#[derive(Default)]
struct RecordingHook {
    joins: Mutex<Vec<(String, String)>>,
    leaves: Mutex<Vec<(String, String)>>,
}

impl RoomHook for RecordingHook {
    fn joined(&self, entity_id: &str, user_id: &str) {
        self.joins
            .lock()
            .unwrap()
            .push((entity_id.to_string(), user_id.to_string()));
    }

    fn left(&self, entity_id: &str, user_id: &str) {
        self.leaves
            .lock()
            .unwrap()
            .push((entity_id.to_string(), user_id.to_string()));
    }
}

#[tokio::test]
async fn room_hooks_observe_membership_changes() {
    let store = Arc::new(CountingStore::new());
    let clock = Arc::new(FixedClock::new(1_000_000));
    let hook = Arc::new(RecordingHook::default());
    let hub = Hub::builder(store, clock)
        .room_hook(EntityKind::Instrument, hook.clone())
        .build();

    let instrument = seed_instrument(&hub).await;
    let entity_id = instrument.id().unwrap().to_string();
    let room = format!("instrument:{entity_id}");

    let user = create_user(&hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&hub, &user_id).await;

    dispatch(&hub, &conn, "sub", json!(room.clone())).await;
    assert_eq!(
        hook.joins.lock().unwrap().as_slice(),
        &[(entity_id.clone(), user_id.clone())]
    );

    dispatch(&hub, &conn, "unsub", json!(room.clone())).await;
    assert_eq!(
        hook.leaves.lock().unwrap().as_slice(),
        &[(entity_id.clone(), user_id.clone())]
    );
}

/// Custom event handler echoing its payload back.
struct EchoHandler;

#[async_trait]
impl EventHandler for EchoHandler {
    async fn handle(&self, values: Value, access: Option<&AccessContext>) -> Envelope<Value> {
        let mut res = Envelope::ok("Echo", values);
        res.status.relation = access.map(|a| a.user_id.clone());
        res
    }
}

#[tokio::test]
async fn custom_events_register_by_required_access() {
    let store = Arc::new(CountingStore::new());
    let clock = Arc::new(FixedClock::new(1_000_000));
    let hub = Hub::builder(store, clock)
        .collection_event(
            EntityKind::Instrument,
            CustomEvent {
                name: "quote".to_string(),
                required: AccessLevel::ReadBasic,
                handler: Arc::new(EchoHandler),
            },
        )
        .collection_event(
            EntityKind::Instrument,
            CustomEvent {
                name: "halt".to_string(),
                required: AccessLevel::ModerateEntity,
                handler: Arc::new(EchoHandler),
            },
        )
        .build();

    let user = create_user(&hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&hub, &user_id).await;

    // quote requires ReadBasic — registered for the default scope.
    let res = dispatch(&hub, &conn, "instrument.quote", json!({ "pair": "EUR_USD" })).await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Echo");
    assert_eq!(res.values.unwrap()["pair"], "EUR_USD");

    // halt requires ModerateEntity — recognized but unregistered.
    let res = dispatch(&hub, &conn, "instrument.halt", json!({})).await;
    assert_eq!(res.status.code, 403);
}

#[tokio::test]
async fn index_dispatch_paginates_with_total() {
    let fx = setup();
    let instruments = fx.hub.collection(EntityKind::Instrument).unwrap();
    for seq in 1..=25 {
        let mut values = Record::new();
        values.set("name", format!("PAIR_{seq:02}"));
        values.set("seq", seq);
        instruments.create(values, None).await.unwrap();
    }

    let user = create_user(&fx.hub, "alice").await;
    let user_id = user.id().unwrap().to_string();
    let (conn, _rx) = login(&fx.hub, &user_id).await;

    let res = dispatch(
        &fx.hub,
        &conn,
        "instrument.index",
        json!({ "index": { "page": 2, "sort": { "field": "seq" } } }),
    )
    .await;
    assert_eq!(res.status.code, 200);
    assert_eq!(res.status.message, "Found 25 total");
    assert_eq!(res.total, 25);
    let page = res.values.unwrap();
    let page = page.as_array().unwrap();
    assert_eq!(page.len(), 5);
    assert_eq!(page[0]["seq"], json!(21));
}
