use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use corral::{
    AccessLevel, EntityKind, Envelope, FixedClock, Hub, Record,
    identity::{IdentityError, IdentityProfile, IdentityProvider},
    live::Connection,
    protocol::{ClientMessage, ServerMessage},
    store::{Criteria, EntityStore, FindOptions, InMemory},
    users::AccessRecord,
};

/// Store wrapper that counts calls per (kind, method), so tests can assert
/// how many durable round trips an operation performed.
#[derive(Default)]
pub struct CountingStore {
    inner: InMemory,
    counts: Mutex<HashMap<(EntityKind, &'static str), usize>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: EntityKind, method: &'static str) -> usize {
        *self
            .counts
            .lock()
            .unwrap()
            .get(&(kind, method))
            .unwrap_or(&0)
    }

    fn bump(&self, kind: EntityKind, method: &'static str) {
        *self.counts.lock().unwrap().entry((kind, method)).or_insert(0) += 1;
    }
}

#[async_trait]
impl EntityStore for CountingStore {
    async fn insert(&self, kind: EntityKind, record: Record) -> corral::Result<Record> {
        self.bump(kind, "insert");
        self.inner.insert(kind, record).await
    }

    async fn find(
        &self,
        kind: EntityKind,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> corral::Result<Vec<Record>> {
        self.bump(kind, "find");
        self.inner.find(kind, criteria, options).await
    }

    async fn find_one(
        &self,
        kind: EntityKind,
        criteria: &Criteria,
    ) -> corral::Result<Option<Record>> {
        self.bump(kind, "find_one");
        self.inner.find_one(kind, criteria).await
    }

    async fn find_by_id(&self, kind: EntityKind, id: &str) -> corral::Result<Option<Record>> {
        self.bump(kind, "find_by_id");
        self.inner.find_by_id(kind, id).await
    }

    async fn update(&self, kind: EntityKind, changes: Record) -> corral::Result<Option<Record>> {
        self.bump(kind, "update");
        self.inner.update(kind, changes).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> corral::Result<bool> {
        self.bump(kind, "delete");
        self.inner.delete(kind, id).await
    }

    async fn count(&self, kind: EntityKind, criteria: &Criteria) -> corral::Result<u64> {
        self.bump(kind, "count");
        self.inner.count(kind, criteria).await
    }
}

/// Identity provider backed by a table of pre-registered profiles.
#[derive(Default)]
pub struct FakeIdentity {
    profiles: Mutex<HashMap<String, IdentityProfile>>,
}

impl FakeIdentity {
    /// Map an authorization code to a profile.
    pub fn register(&self, code: &str, profile: IdentityProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(code.to_string(), profile);
    }
}

pub fn fake_profile(account_id: &str, name: &str) -> IdentityProfile {
    IdentityProfile {
        provider: "discord".to_string(),
        provider_account_id: account_id.to_string(),
        name: name.to_string(),
        email: Some(format!("{name}@example.com")),
        email_verified: true,
        image: None,
        access_token: "token".to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: None,
        scope: Some("identify".to_string()),
        expires_in_ms: Some(3_600_000),
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    fn provider(&self) -> &str {
        "discord"
    }

    async fn exchange(&self, code: &str) -> Result<IdentityProfile, IdentityError> {
        self.profiles.lock().unwrap().get(code).cloned().ok_or_else(|| {
            IdentityError::ExchangeFailed {
                provider: "discord".to_string(),
                reason: "unknown code".to_string(),
            }
        })
    }
}

/// Everything a test needs: the hub plus handles to its collaborators.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub store: Arc<CountingStore>,
    pub clock: Arc<FixedClock>,
    pub identity: Arc<FakeIdentity>,
}

/// Build a hub over a counting in-memory store and a fixed clock.
pub fn setup() -> TestHub {
    let store = Arc::new(CountingStore::new());
    let clock = Arc::new(FixedClock::new(1_000_000));
    let identity = Arc::new(FakeIdentity::default());
    let hub = Hub::builder(store.clone(), clock.clone())
        .identity(identity.clone())
        .build();
    TestHub {
        hub,
        store,
        clock,
        identity,
    }
}

/// Create a user record directly through the directory.
pub async fn create_user(hub: &Arc<Hub>, name: &str) -> Record {
    let mut values = Record::new();
    values.set("name", name);
    values.set("email", format!("{name}@example.com"));
    values.set("image", format!("https://example.com/{name}.png"));
    hub.directory()
        .users()
        .create(values, None)
        .await
        .expect("user creation")
}

/// Overwrite one scope on a user's access record. Must run before the
/// user's handshake, since listeners register from the scopes seen then.
pub async fn set_scope(hub: &Arc<Hub>, user_id: &str, kind: EntityKind, level: AccessLevel) {
    let record = hub
        .directory()
        .find_or_create_access(user_id)
        .await
        .expect("access lookup")
        .expect("access record");
    let parsed: AccessRecord = record.deserialize().expect("access record shape");
    let mut scopes = parsed.scopes;
    scopes.insert(kind, level);

    let access = hub
        .collection(EntityKind::Access)
        .expect("access collection");
    let mut changes = Record::new();
    changes.set_id(record.id().expect("persisted access record"));
    changes.set("scopes", serde_json::to_value(&scopes).unwrap());
    access
        .update(changes)
        .await
        .expect("scope update")
        .expect("access record exists");
}

/// Issue a session for a user and complete the `session` handshake on a
/// fresh connection.
pub async fn login(
    hub: &Arc<Hub>,
    user_id: &str,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerMessage>) {
    let (token, _session) = hub
        .directory()
        .issue_session(user_id)
        .await
        .expect("session issue");
    let (conn, rx) = hub.connect();
    let response = dispatch(hub, &conn, "session", serde_json::json!({ "token": token })).await;
    assert_eq!(response.status.code, 200, "handshake: {:?}", response.status);
    assert_eq!(response.status.message, "Session established");
    (conn, rx)
}

/// Dispatch a single event and return its response envelope.
pub async fn dispatch(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    event: &str,
    values: Value,
) -> Envelope<Value> {
    let message = ClientMessage {
        event: event.to_string(),
        values,
        req_id: None,
    };
    hub.dispatch(conn, &message).await
}

/// Receive the next broadcast with a timeout, panicking when none arrives.
pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("connection channel closed")
}

/// Assert that no broadcast arrives within a short window.
pub async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected broadcast: {:?}", outcome);
}
