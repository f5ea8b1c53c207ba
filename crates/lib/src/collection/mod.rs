//! The generic collection engine.
//!
//! One [`Collection`] instance backs each logical collection, composing the
//! durable store, the ACE layer, the staleness cache, and the redaction
//! policy behind five uniform request operations
//! (create/read/index/update/delete). Access enforcement happens at
//! listener-registration time in the live layer; the engine trusts the tier
//! its handlers were registered with.

mod cache;
mod errors;

pub use cache::{CacheOutcome, STALENESS_WINDOW_MS, StalenessCache};
pub use errors::CollectionError;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::Result;
use crate::access::{AccessContext, AccessLevel, AceStore, GrantLists};
use crate::clock::Clock;
use crate::entity::{BASE_FIELDS, EntityKind, Record, SYSTEM_USER};
use crate::protocol::{Envelope, IndexParams};
use crate::store::{Criteria, EntityStore, FindOptions};

/// Records per index page.
pub const PAGE_SIZE: usize = 20;

/// Receiver of successful mutations: the full record for the full-access
/// room and the redacted projection for the basic room. Implementations
/// must not block — delivery is fire-and-forget.
pub trait ChangeSink: Send + Sync {
    fn emit_changes(&self, kind: EntityKind, full: &Record, basic: Option<&Record>);
}

/// A sink that drops every change. Used by collections with no live wiring
/// and by tests that don't observe broadcasts.
pub struct NullSink;

impl ChangeSink for NullSink {
    fn emit_changes(&self, _kind: EntityKind, _full: &Record, _basic: Option<&Record>) {}
}

/// Fire-and-forget notifications of room membership changes, forwarded to
/// the collection owning the room.
pub trait RoomHook: Send + Sync {
    fn joined(&self, entity_id: &str, user_id: &str);
    fn left(&self, entity_id: &str, user_id: &str);
}

/// Handler for a collection-declared extension event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, values: Value, access: Option<&AccessContext>) -> Envelope<Value>;
}

/// A collection-declared extension event: registered on a connection only
/// when the caller's resolved access reaches `required`.
#[derive(Clone)]
pub struct CustomEvent {
    pub name: String,
    pub required: AccessLevel,
    pub handler: Arc<dyn EventHandler>,
}

/// Builder for [`Collection`].
pub struct CollectionBuilder {
    kind: EntityKind,
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ChangeSink>,
    ace: Option<Arc<AceStore>>,
    ace_parent: Option<EntityKind>,
    basic_fields: Vec<String>,
    cached: bool,
    collection_events: Vec<CustomEvent>,
    entity_events: Vec<CustomEvent>,
    room_hook: Option<Arc<dyn RoomHook>>,
}

impl CollectionBuilder {
    /// Allow-listed fields shown to callers below full-read access. The
    /// base fields are always included.
    pub fn basic_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.basic_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Enable entity-level access via the ACE store.
    pub fn ace(mut self, ace: Arc<AceStore>) -> Self {
        self.ace = Some(ace);
        self
    }

    /// Resolve scopes and ACEs against another kind instead of this
    /// collection's own (e.g. the access collection defers to user).
    pub fn ace_parent(mut self, parent: EntityKind) -> Self {
        self.ace_parent = Some(parent);
        self
    }

    /// Opt into the write-coalescing staleness cache.
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn collection_event(mut self, event: CustomEvent) -> Self {
        self.collection_events.push(event);
        self
    }

    pub fn entity_event(mut self, event: CustomEvent) -> Self {
        self.entity_events.push(event);
        self
    }

    pub fn room_hook(mut self, hook: Arc<dyn RoomHook>) -> Self {
        self.room_hook = Some(hook);
        self
    }

    pub fn build(self) -> Arc<Collection> {
        let mut basic_fields: Vec<String> =
            BASE_FIELDS.iter().map(|f| f.to_string()).collect();
        for field in self.basic_fields {
            if !basic_fields.contains(&field) {
                basic_fields.push(field);
            }
        }
        Arc::new(Collection {
            kind: self.kind,
            store: self.store,
            clock: self.clock,
            sink: self.sink,
            ace: self.ace,
            ace_parent: self.ace_parent,
            basic_fields,
            cache: self.cached.then(StalenessCache::new),
            collection_events: self.collection_events,
            entity_events: self.entity_events,
            room_hook: self.room_hook,
        })
    }
}

/// A logical collection: uniform CRUD with access-scaled behavior.
pub struct Collection {
    kind: EntityKind,
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ChangeSink>,
    ace: Option<Arc<AceStore>>,
    ace_parent: Option<EntityKind>,
    basic_fields: Vec<String>,
    cache: Option<StalenessCache>,
    collection_events: Vec<CustomEvent>,
    entity_events: Vec<CustomEvent>,
    room_hook: Option<Arc<dyn RoomHook>>,
}

impl Collection {
    pub fn builder(
        kind: EntityKind,
        store: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
    ) -> CollectionBuilder {
        CollectionBuilder {
            kind,
            store,
            clock,
            sink: Arc::new(NullSink),
            ace: None,
            ace_parent: None,
            basic_fields: Vec::new(),
            cached: false,
            collection_events: Vec::new(),
            entity_events: Vec::new(),
            room_hook: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The kind whose scopes and ACEs govern this collection.
    pub fn scope_kind(&self) -> EntityKind {
        self.ace_parent.unwrap_or(self.kind)
    }

    pub fn collection_events(&self) -> &[CustomEvent] {
        &self.collection_events
    }

    pub fn entity_events(&self) -> &[CustomEvent] {
        &self.entity_events
    }

    pub fn room_hook(&self) -> Option<&Arc<dyn RoomHook>> {
        self.room_hook.as_ref()
    }

    /*
     * Access resolution
     */

    /// Find the highest access level a caller holds over this collection,
    /// optionally narrowed to one entity.
    ///
    /// Collection scope is the floor; an entity's ACE can only raise it.
    /// The grant lists are scanned ascending from the scope level and the
    /// first match wins, so a caller somehow present at two levels
    /// resolves to the lower one — fail closed.
    pub async fn highest_access(
        &self,
        access: Option<&AccessContext>,
        entity_id: Option<&str>,
    ) -> AccessLevel {
        let Some(ctx) = access else {
            return AccessLevel::None;
        };
        let collection_access = ctx.scope_for(self.scope_kind());

        // Collection moderators hold entity-level control by definition;
        // skip the ACE round trip.
        if collection_access == AccessLevel::ModerateEntity {
            return collection_access;
        }

        let (Some(entity_id), Some(ace)) = (entity_id, self.ace.as_ref()) else {
            return collection_access;
        };

        let entry = match ace.lookup(self.scope_kind(), entity_id, None).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(kind = %self.kind, entity_id, error = %e, "ace lookup failed");
                return collection_access;
            }
        };

        for level in collection_access.and_above() {
            if entry.grants.contains(level, &ctx.user_id) {
                return level;
            }
        }
        collection_access
    }

    /// Check that a caller reaches `required`, annotating the envelope with
    /// the access label on success or replacing it with the unauthorized
    /// default on failure. Returns the resolved level either way.
    pub async fn check_access<T>(
        &self,
        access: Option<&AccessContext>,
        entity_id: Option<&str>,
        required: AccessLevel,
        response: &mut Envelope<T>,
    ) -> AccessLevel {
        let highest = self.highest_access(access, entity_id).await;
        if highest >= required {
            response.status.relation = Some(highest.label().to_string());
        } else {
            *response = Envelope::unauthorized();
        }
        highest
    }

    /*
     * Request operations
     */

    /// Request to create and return a record.
    pub async fn create_request(
        &self,
        values: Record,
        access: Option<&AccessContext>,
    ) -> Envelope<Record> {
        let location = format!("{}.create", self.kind);
        debug!(user = caller_name(access), "{location} request");
        let mut res = Envelope::error();

        match self.create(values, access.map(|a| a.user_id.as_str())).await {
            Ok(created) => {
                res.status.code = 200;
                res.status.message = "Created".to_string();
                res.values = Some(created);
            }
            Err(e) => warn!(kind = %self.kind, error = %e, "create failed"),
        }

        let id = res.values.as_ref().and_then(|r| r.id()).map(str::to_string);
        res.status.log(&location, id.as_deref());
        res
    }

    /// Request to find and return a record.
    pub async fn read_request(
        &self,
        criteria: Criteria,
        access: Option<&AccessContext>,
        read_full: bool,
    ) -> Envelope<Record> {
        let location = format!("{}.read", self.kind);
        debug!(user = caller_name(access), "{location} request");

        let res = match self.store.find_one(self.kind, &criteria).await {
            Ok(Some(found)) => {
                let record = if read_full {
                    found
                } else {
                    self.redact(&found)
                };
                Envelope::ok("Found", record)
            }
            Ok(None) => Envelope::not_found(),
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "read failed");
                Envelope::error()
            }
        };

        let id = res.values.as_ref().and_then(|r| r.id()).map(str::to_string);
        res.status.log(&location, id.as_deref());
        res
    }

    /// Request a page of records plus the unpaginated match count.
    pub async fn index_request(
        &self,
        criteria: Criteria,
        index: Option<IndexParams>,
        access: Option<&AccessContext>,
        read_full: bool,
    ) -> Envelope<Vec<Record>> {
        let location = format!("{}.index", self.kind);
        debug!(user = caller_name(access), "{location} request");

        let index = index.unwrap_or_default();
        let skip = index
            .page
            .map(|page| (page.saturating_sub(1) as usize) * PAGE_SIZE)
            .unwrap_or(0);
        let options = FindOptions {
            skip,
            limit: Some(PAGE_SIZE),
            sort: index.sort,
        };

        let res = match self.store.find(self.kind, &criteria, &options).await {
            Ok(found) => match self.store.count(self.kind, &criteria).await {
                Ok(total) => {
                    let page = if read_full {
                        found
                    } else {
                        found.iter().map(|r| self.redact(r)).collect()
                    };
                    let mut envelope = Envelope::ok(format!("Found {total} total"), page);
                    envelope.total = total;
                    envelope
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "index count failed");
                    Envelope::error()
                }
            },
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "index failed");
                Envelope::error()
            }
        };

        res.status.log(&location, None);
        res
    }

    /// Request to update and return a record. A successful update is
    /// broadcast to the entity's rooms.
    pub async fn update_request(
        &self,
        mut values: Record,
        access: Option<&AccessContext>,
    ) -> Envelope<Record> {
        let location = format!("{}.update", self.kind);
        debug!(user = caller_name(access), "{location} request");
        let mut res = Envelope::error();

        let author = access.map(|a| a.user_id.as_str()).unwrap_or(SYSTEM_USER);
        values.stamp_updated(self.clock.now_millis(), author);

        match self.update(values).await {
            Ok(Some(updated)) => {
                res.status.code = 200;
                res.status.message = "Updated".to_string();
                self.emit_changes(&updated);
                res.values = Some(updated);
            }
            // A store update that yields nothing leaves the default error
            // envelope untouched.
            Ok(None) => {}
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "update failed");
                res = Envelope::from_error(&e);
            }
        }

        let id = res.values.as_ref().and_then(|r| r.id()).map(str::to_string);
        res.status.log(&location, id.as_deref());
        res
    }

    /// Request to delete a record by id.
    pub async fn delete_request(
        &self,
        values: Record,
        access: Option<&AccessContext>,
    ) -> Envelope<Value> {
        let location = format!("{}.delete", self.kind);
        debug!(user = caller_name(access), "{location} request");

        let res = match values.id() {
            None => Envelope::from_error(
                &CollectionError::MissingId {
                    kind: self.kind,
                    operation: "delete",
                }
                .into(),
            ),
            Some(id) => match self.store.delete(self.kind, id).await {
                Ok(true) => Envelope::ok("Deleted", json!({ "acknowledged": true })),
                Ok(false) => Envelope::error(),
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "delete failed");
                    Envelope::error()
                }
            },
        };

        res.status.log(&location, values.id());
        res
    }

    /*
     * Raw operations
     */

    /// Persist a new record. All base stamps are set here; anything the
    /// caller supplied for them is discarded. For ACE-enabled collections
    /// the new entity's ACE is initialized granting `ModerateEntity` to
    /// the creator (no grant when the record was created by the system).
    pub async fn create(&self, mut values: Record, created_by: Option<&str>) -> Result<Record> {
        for field in BASE_FIELDS {
            values.remove(field);
        }
        let author = created_by.unwrap_or(SYSTEM_USER);
        values.stamp_created(self.clock.now_millis(), author);

        let created = self.store.insert(self.kind, values).await?;

        if self.kind != EntityKind::Ace
            && let Some(ace) = &self.ace
            && let Some(id) = created.id()
        {
            let grants = match created_by {
                Some(user) if user != SYSTEM_USER => GrantLists::with_moderator(user),
                _ => GrantLists::empty(),
            };
            ace.lookup(self.scope_kind(), id, Some(grants)).await?;
        }

        Ok(created)
    }

    pub async fn find(&self, criteria: &Criteria, options: &FindOptions) -> Result<Vec<Record>> {
        self.store.find(self.kind, criteria, options).await
    }

    pub async fn find_one(&self, criteria: &Criteria) -> Result<Option<Record>> {
        self.store.find_one(self.kind, criteria).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.store.find_by_id(self.kind, id).await
    }

    /// Update by id through the staleness cache when this collection is
    /// cached, otherwise straight through to the store.
    ///
    /// Cached path: a merge landing inside the staleness window is
    /// returned without a durable write; an out-of-window merge is written
    /// through, and the cache keeps the local merge rather than the
    /// store's echo. A first update for an id populates the cache with the
    /// durable result.
    pub async fn update(&self, mut values: Record) -> Result<Option<Record>> {
        let Some(id) = values.id().map(str::to_string) else {
            return Err(CollectionError::MissingId {
                kind: self.kind,
                operation: "update",
            }
            .into());
        };

        if values.updated_at().is_none() {
            values.set("updatedAt", self.clock.now_millis());
        }
        if values.updated_by().is_none() {
            values.set("updatedBy", SYSTEM_USER);
        }

        let mut staged = None;
        if let Some(cache) = &self.cache {
            match cache.apply(&id, &values).await {
                CacheOutcome::Fresh(merged) => return Ok(Some(merged)),
                CacheOutcome::Stale(merged) => staged = Some(merged),
                CacheOutcome::Miss => {}
            }
        }

        let had_entry = staged.is_some();
        let updated = self
            .store
            .update(self.kind, staged.unwrap_or(values))
            .await?;

        if let Some(cache) = &self.cache
            && !had_entry
            && let Some(record) = &updated
        {
            cache.populate(&id, record.clone()).await;
        }

        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(self.kind, id).await
    }

    /*
     * Redaction & broadcast
     */

    /// Project a record down to the allow-listed fields. Operates on a
    /// clone so concurrent readers of the same stored record never observe
    /// another caller's redaction pass.
    pub fn redact(&self, record: &Record) -> Record {
        let mut copy = record.clone();
        copy.retain_fields(&self.basic_fields);
        copy
    }

    /// Push a mutated record to the entity's rooms: full payload to the
    /// full room, redacted payload to the basic room.
    pub fn emit_changes(&self, record: &Record) {
        let basic = self.redact(record);
        self.sink.emit_changes(self.kind, record, Some(&basic));
    }

    /// The staleness cache, when this collection opted in.
    pub fn cache(&self) -> Option<&StalenessCache> {
        self.cache.as_ref()
    }
}

fn caller_name(access: Option<&AccessContext>) -> &str {
    access.map(|a| a.user_id.as_str()).unwrap_or("unknown")
}
