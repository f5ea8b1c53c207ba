use std::sync::Arc;

use corral::{
    AccessContext, AccessLevel, Collection, EntityKind, FixedClock, Scopes,
    access::{AceStore, GrantLists},
    store::EntityStore,
};

use super::helpers::CountingStore;

fn context(kind: EntityKind, level: AccessLevel) -> AccessContext {
    let mut scopes = Scopes::new();
    scopes.insert(kind, level);
    AccessContext::new("u1", scopes)
}

struct Fixture {
    store: Arc<CountingStore>,
    ace: Arc<AceStore>,
    collection: Arc<Collection>,
}

fn fixture() -> Fixture {
    let store = Arc::new(CountingStore::new());
    let clock = Arc::new(FixedClock::new(1_000));
    let ace = Arc::new(AceStore::new(
        store.clone() as Arc<dyn EntityStore>,
        clock.clone(),
    ));
    let collection = Collection::builder(EntityKind::Instrument, store.clone(), clock)
        .basic_fields(["name"])
        .ace(ace.clone())
        .build();
    Fixture {
        store,
        ace,
        collection,
    }
}

#[tokio::test]
async fn unauthenticated_caller_resolves_to_none() {
    let fx = fixture();
    let level = fx.collection.highest_access(None, Some("e1")).await;
    assert_eq!(level, AccessLevel::None);
    // Fail-closed without a single store call.
    assert_eq!(fx.store.count(EntityKind::Ace, "find_one"), 0);
}

#[tokio::test]
async fn collection_scope_is_the_floor() {
    let fx = fixture();
    let ctx = context(EntityKind::Instrument, AccessLevel::ReadFull);

    // Without an entity there is nothing to raise the scope.
    let level = fx.collection.highest_access(Some(&ctx), None).await;
    assert_eq!(level, AccessLevel::ReadFull);

    // An entity with no grants resolves to the scope too.
    let level = fx.collection.highest_access(Some(&ctx), Some("e1")).await;
    assert_eq!(level, AccessLevel::ReadFull);
}

#[tokio::test]
async fn entity_grant_raises_scope() {
    let fx = fixture();
    fx.ace
        .ensure_grant(
            EntityKind::Instrument,
            "e1",
            AccessLevel::ModerateEntity,
            "u1",
        )
        .await
        .unwrap();

    let ctx = context(EntityKind::Instrument, AccessLevel::ReadBasic);
    let level = fx.collection.highest_access(Some(&ctx), Some("e1")).await;
    assert_eq!(level, AccessLevel::ModerateEntity);

    // The grant is per-entity: another id stays at the scope.
    let level = fx.collection.highest_access(Some(&ctx), Some("e2")).await;
    assert_eq!(level, AccessLevel::ReadBasic);
}

#[tokio::test]
async fn ascending_scan_stops_at_first_match() {
    let fx = fixture();
    fx.ace
        .ensure_grant(EntityKind::Instrument, "e1", AccessLevel::ReadBasic, "u1")
        .await
        .unwrap();
    fx.ace
        .ensure_grant(
            EntityKind::Instrument,
            "e1",
            AccessLevel::ModerateEntity,
            "u1",
        )
        .await
        .unwrap();

    // Present at two levels resolves to the lower one.
    let ctx = context(EntityKind::Instrument, AccessLevel::None);
    let level = fx.collection.highest_access(Some(&ctx), Some("e1")).await;
    assert_eq!(level, AccessLevel::ReadBasic);
}

#[tokio::test]
async fn moderator_scope_skips_ace_lookup() {
    let fx = fixture();
    let ctx = context(EntityKind::Instrument, AccessLevel::ModerateEntity);

    let level = fx.collection.highest_access(Some(&ctx), Some("e1")).await;
    assert_eq!(level, AccessLevel::ModerateEntity);

    assert_eq!(fx.store.count(EntityKind::Ace, "find_one"), 0);
    assert_eq!(fx.store.count(EntityKind::Ace, "insert"), 0);
}

#[tokio::test]
async fn resolver_never_invents_access() {
    let fx = fixture();
    fx.ace
        .ensure_grant(EntityKind::Instrument, "e1", AccessLevel::ReadFull, "u1")
        .await
        .unwrap();

    for scope in AccessLevel::ALL {
        let ctx = context(EntityKind::Instrument, scope);
        let resolved = fx.collection.highest_access(Some(&ctx), Some("e1")).await;
        let ceiling = scope.max(AccessLevel::ReadFull);
        assert!(
            resolved <= ceiling,
            "scope {scope:?} resolved to {resolved:?}, above {ceiling:?}"
        );
        assert!(resolved >= scope, "resolver dropped below the scope floor");
    }
}

#[tokio::test]
async fn ace_lookup_lazily_creates_one_entry() {
    let fx = fixture();

    let ace = fx
        .ace
        .lookup(EntityKind::Instrument, "e1", None)
        .await
        .unwrap();
    assert_eq!(ace.grants, GrantLists::empty());
    assert_eq!(fx.store.count(EntityKind::Ace, "insert"), 1);

    // Second lookup reads the persisted entry.
    fx.ace
        .lookup(EntityKind::Instrument, "e1", None)
        .await
        .unwrap();
    assert_eq!(fx.store.count(EntityKind::Ace, "insert"), 1);
}

#[tokio::test]
async fn check_access_annotates_or_rejects() {
    let fx = fixture();
    let ctx = context(EntityKind::Instrument, AccessLevel::ReadFull);

    let mut ok: corral::Envelope<serde_json::Value> = corral::Envelope::error();
    let level = fx
        .collection
        .check_access(Some(&ctx), None, AccessLevel::ReadBasic, &mut ok)
        .await;
    assert_eq!(level, AccessLevel::ReadFull);
    assert_eq!(ok.status.relation.as_deref(), Some("Viewer(full)"));

    let mut rejected: corral::Envelope<serde_json::Value> = corral::Envelope::error();
    fx.collection
        .check_access(Some(&ctx), None, AccessLevel::ModerateEntity, &mut rejected)
        .await;
    assert_eq!(rejected.status.code, 403);
    assert_eq!(rejected.status.message, "Unauthorized");
}
