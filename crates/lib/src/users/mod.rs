//! The user directory: the collaborator collections behind authentication.
//!
//! Users, durable sessions, identity-provider accounts, and per-user scope
//! records are ordinary collections driven through the generic engine; this
//! module wires them together for the two handshake flows (`session` and
//! `discord`) and the scope bookkeeping they need. It calls into the
//! engine rather than specializing it.

mod access;

pub use access::{AccessRecord, default_scopes};

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::Result;
use crate::access::{AccessLevel, AceStore};
use crate::clock::Clock;
use crate::collection::Collection;
use crate::entity::{EntityKind, Record};
use crate::identity::IdentityProvider;
use crate::store::Criteria;

/// Wiring of the user-facing collaborator collections.
pub struct Directory {
    users: Arc<Collection>,
    sessions: Arc<Collection>,
    accounts: Arc<Collection>,
    access: Arc<Collection>,
    ace: Arc<AceStore>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    session_ttl_ms: i64,
}

impl Directory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<Collection>,
        sessions: Arc<Collection>,
        accounts: Arc<Collection>,
        access: Arc<Collection>,
        ace: Arc<AceStore>,
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityProvider>,
        session_ttl_ms: i64,
    ) -> Self {
        Self {
            users,
            sessions,
            accounts,
            access,
            ace,
            clock,
            identity,
            session_ttl_ms,
        }
    }

    pub fn users(&self) -> &Arc<Collection> {
        &self.users
    }

    /// Validate a bearer token against the durable sessions and return the
    /// refreshed user record. Unknown or expired tokens resolve to "no
    /// user" rather than an error, so call sites decide how to answer.
    pub async fn session_sync(&self, token: &str) -> Result<Option<Record>> {
        let Some(user) = self.find_by_session(token).await? else {
            return Ok(None);
        };
        let Some(user_id) = user.id().map(str::to_string) else {
            return Ok(None);
        };

        // Users moderate their own record.
        self.ace
            .ensure_grant(
                EntityKind::User,
                &user_id,
                AccessLevel::ModerateEntity,
                &user_id,
            )
            .await?;

        let mut changes = Record::new();
        changes.set_id(&user_id);
        changes.stamp_updated(self.clock.now_millis(), &user_id);
        match self.users.update(changes).await? {
            Some(updated) => Ok(Some(updated)),
            None => {
                warn!(user_id = %user_id, "failed to refresh user on session sync");
                Ok(None)
            }
        }
    }

    /// Resolve an identity-provider authorization code to a user record,
    /// creating the user, their account linkage, and their self-ACE on
    /// first contact.
    pub async fn identity_sync(&self, code: &str) -> Result<Option<Record>> {
        let profile = match self.identity.exchange(code).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(provider = self.identity.provider(), error = %e, "identity exchange failed");
                return Ok(None);
            }
        };

        let linkage = Criteria::from_pairs([
            ("provider", json!(profile.provider)),
            ("providerAccountId", json!(profile.provider_account_id)),
        ]);
        if let Some(account) = self.accounts.find_one(&linkage).await? {
            let Some(user_id) = account.get_str("userId") else {
                warn!(provider = %profile.provider, "account record missing userId");
                return Ok(None);
            };
            return self.users.find_by_id(user_id).await;
        }

        // First contact: create the user, then link the account.
        let mut values = Record::new();
        values.set("name", profile.name.clone());
        values.set("emailVerified", profile.email_verified);
        if let Some(email) = &profile.email {
            values.set("email", email.clone());
        }
        if let Some(image) = &profile.image {
            values.set("image", image.clone());
        }
        let user = self.users.create(values, None).await?;
        let Some(user_id) = user.id().map(str::to_string) else {
            return Ok(None);
        };

        self.ace
            .ensure_grant(
                EntityKind::User,
                &user_id,
                AccessLevel::ModerateEntity,
                &user_id,
            )
            .await?;

        let mut account = Record::new();
        account.set("provider", profile.provider.clone());
        account.set("providerAccountId", profile.provider_account_id.clone());
        account.set("type", "oauth");
        account.set("access_token", profile.access_token.clone());
        account.set("token_type", profile.token_type.clone());
        if let Some(refresh) = &profile.refresh_token {
            account.set("refresh_token", refresh.clone());
        }
        if let Some(scope) = &profile.scope {
            account.set("scope", scope.clone());
        }
        if let Some(ttl) = profile.expires_in_ms {
            account.set("expires_at", self.clock.now_millis() + ttl);
        }
        account.set("userId", user_id);
        self.find_or_create_account(account).await?;

        Ok(Some(user))
    }

    /// Create a durable session for a user and return its bearer token.
    pub async fn issue_session(&self, user_id: &str) -> Result<(String, Record)> {
        let token = Uuid::new_v4().to_string();
        let mut values = Record::new();
        values.set("sessionToken", token.clone());
        values.set("userId", user_id);
        values.set("expires", self.clock.now_millis() + self.session_ttl_ms);
        let session = self.sessions.create(values, None).await?;
        Ok((token, session))
    }

    async fn find_by_session(&self, token: &str) -> Result<Option<Record>> {
        let criteria = Criteria::from_pairs([("sessionToken", json!(token))]);
        let Some(session) = self.sessions.find_one(&criteria).await? else {
            warn!("no valid session found for token");
            return Ok(None);
        };

        let expires = session.get("expires").and_then(Value::as_i64).unwrap_or(0);
        if expires < self.clock.now_millis() {
            warn!("session expired");
            return Ok(None);
        }

        let Some(user_id) = session.get_str("userId") else {
            return Ok(None);
        };
        self.users.find_by_id(user_id).await
    }

    async fn find_or_create_account(&self, values: Record) -> Result<Option<Record>> {
        let (Some(provider), Some(account_id)) =
            (values.get("provider"), values.get("providerAccountId"))
        else {
            return Ok(None);
        };
        let linkage = Criteria::from_pairs([
            ("provider", provider.clone()),
            ("providerAccountId", account_id.clone()),
        ]);
        if let Some(found) = self.accounts.find_one(&linkage).await? {
            return Ok(Some(found));
        }
        Ok(Some(self.accounts.create(values, None).await?))
    }

    /// Fetch the user's scope record, creating it with the default scopes
    /// on first contact and migrating stored scopes forward when defaults
    /// have been raised since.
    pub async fn find_or_create_access(&self, user_id: &str) -> Result<Option<Record>> {
        let criteria = Criteria::from_pairs([("userId", json!(user_id))]);
        if let Some(found) = self.access.find_one(&criteria).await? {
            return self.migrate_access(found).await.map(Some);
        }

        let mut values = Record::new();
        values.set("userId", user_id);
        values.set("scopes", serde_json::to_value(default_scopes())?);
        let created = match self.access.create(values, None).await {
            Ok(created) => created,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to create access record");
                return Ok(None);
            }
        };

        // Back-stamp the owning user and announce the change.
        if let Some(access_id) = created.id() {
            let mut changes = Record::new();
            changes.set_id(user_id);
            changes.set("accessId", access_id);
            changes.stamp_updated(self.clock.now_millis(), user_id);
            if let Some(updated) = self.users.update(changes).await? {
                self.users.emit_changes(&updated);
            }
        }

        Ok(Some(created))
    }

    /// Raise any stored scope that is missing or below the current
    /// default, persisting when something changed.
    async fn migrate_access(&self, mut record: Record) -> Result<Record> {
        let parsed: AccessRecord = record.deserialize()?;
        let mut scopes = parsed.scopes;
        let mut changed = false;
        for (kind, default_level) in default_scopes() {
            let current = scopes.get(&kind).copied().unwrap_or_default();
            if default_level > current {
                scopes.insert(kind, default_level);
                changed = true;
            } else if !scopes.contains_key(&kind) {
                scopes.insert(kind, current);
                changed = true;
            }
        }

        if changed {
            record.set("scopes", serde_json::to_value(&scopes)?);
            if let Some(id) = record.id().map(str::to_string) {
                let mut changes = Record::new();
                changes.set_id(id);
                changes.set("scopes", serde_json::to_value(&scopes)?);
                changes.stamp_updated(self.clock.now_millis(), &parsed.user_id);
                if self.access.update(changes).await?.is_none() {
                    warn!(user_id = %parsed.user_id, "failed to persist migrated scopes");
                }
            }
        }
        Ok(record)
    }
}
