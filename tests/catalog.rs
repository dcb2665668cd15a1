mod common;

use chrono::TimeDelta;
use common::{settings, test_store};
use ephemeral_store::{
    models::object::{ObjectEntry, ObjectId},
    services::catalog::{CatalogError, RedeemOutcome, truncate_to_millis},
};

fn entry_at(created_at: chrono::DateTime<chrono::Utc>) -> ObjectEntry {
    ObjectEntry {
        id: ObjectId::generate(),
        size_bytes: 42,
        content_type: "image/png".into(),
        original_name: "cat.png".into(),
        created_at: truncate_to_millis(created_at),
        redemption_count: 0,
    }
}

#[tokio::test]
async fn insert_then_get_returns_the_same_entry() {
    let store = test_store(settings(1024)).await;
    let entry = entry_at(store.now());

    store.service.catalog.insert(&entry).await.unwrap();
    let fetched = store.service.catalog.get(&entry.id).await.unwrap();
    assert_eq!(fetched, Some(entry));
}

#[tokio::test]
async fn duplicate_insert_is_a_conflict() {
    let store = test_store(settings(1024)).await;
    let entry = entry_at(store.now());

    store.service.catalog.insert(&entry).await.unwrap();
    let err = store.service.catalog.insert(&entry).await.unwrap_err();
    assert!(matches!(err, CatalogError::Conflict(id) if id == entry.id));
}

#[tokio::test]
async fn get_and_redeem_of_unknown_id() {
    let store = test_store(settings(1024)).await;
    let id = ObjectId::generate();

    assert!(store.service.catalog.get(&id).await.unwrap().is_none());
    let outcome = store.service.catalog.try_redeem(&id, store.now()).await.unwrap();
    assert_eq!(outcome, RedeemOutcome::NotFound);
    assert!(!store.service.catalog.delete(&id).await.unwrap());
}

#[tokio::test]
async fn redeem_increments_once() {
    let store = test_store(settings(1024)).await;
    let entry = entry_at(store.now());
    store.service.catalog.insert(&entry).await.unwrap();

    let first = store.service.catalog.try_redeem(&entry.id, store.now()).await.unwrap();
    let RedeemOutcome::Redeemed(redeemed) = first else {
        panic!("expected redemption, got {first:?}");
    };
    assert_eq!(redeemed.redemption_count, 1);
    assert_eq!(redeemed.original_name, "cat.png");

    let second = store.service.catalog.try_redeem(&entry.id, store.now()).await.unwrap();
    assert_eq!(second, RedeemOutcome::AlreadyConsumed { stale: false });
}

#[tokio::test]
async fn consumed_wins_over_expired() {
    let store = test_store(settings(1024)).await;
    let entry = entry_at(store.now());
    store.service.catalog.insert(&entry).await.unwrap();
    store.service.catalog.try_redeem(&entry.id, store.now()).await.unwrap();

    store.advance(TimeDelta::hours(1));
    let outcome = store.service.catalog.try_redeem(&entry.id, store.now()).await.unwrap();
    assert_eq!(outcome, RedeemOutcome::AlreadyConsumed { stale: true });
}

#[tokio::test]
async fn list_older_than_is_strict_and_ordered() {
    let store = test_store(settings(1024)).await;
    let base = store.now();
    let oldest = entry_at(base - TimeDelta::minutes(30));
    let older = entry_at(base - TimeDelta::minutes(25));
    let at_cutoff = entry_at(base - TimeDelta::minutes(20));
    let recent = entry_at(base);
    for entry in [&recent, &at_cutoff, &older, &oldest] {
        store.service.catalog.insert(entry).await.unwrap();
    }

    let ids = store
        .service
        .catalog
        .list_older_than(at_cutoff.created_at)
        .await
        .unwrap();
    assert_eq!(ids, vec![oldest.id, older.id]);
}
