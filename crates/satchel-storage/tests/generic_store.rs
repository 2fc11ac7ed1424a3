//! End-to-end tests for a generic (release_0) embedded store.

use satchel_storage::{DbStore, EntryTag, ProvisionOptions, StoreErrorKind};
use tempfile::TempDir;

fn tags(pairs: &[(&str, &str)]) -> Vec<EntryTag> {
    pairs.iter().map(|(n, v)| EntryTag::new(*n, *v)).collect()
}

struct TestStore {
    store: DbStore,
    _dir: TempDir,
}

async fn provision_generic() -> TestStore {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("sqlite://{}", dir.path().join("store.db").display());
    let store = DbStore::provision(
        &uri,
        ProvisionOptions {
            profile: Some("test_profile".to_string()),
            recreate: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    TestStore { store, _dir: dir }
}

/// Seeds the three "people" records used by the WQL scenarios.
async fn seed_people(store: &DbStore) {
    let mut session = store.session(None).await.unwrap();
    session
        .insert(
            "people",
            "person1",
            r#"{"name":"Alice"}"#,
            &tags(&[
                ("attr::person.status", "active"),
                ("attr::person.gender", "F"),
                ("attr::person.birthdate::value", "19900101"),
            ]),
            None,
        )
        .await
        .unwrap();
    session
        .insert(
            "people",
            "person2",
            r#"{"name":"Bob"}"#,
            &tags(&[
                ("attr::person.status", "active"),
                ("attr::person.gender", "M"),
                ("attr::person.birthdate::value", "19850101"),
            ]),
            None,
        )
        .await
        .unwrap();
    session
        .insert(
            "people",
            "person3",
            r#"{"name":"Carol"}"#,
            &tags(&[
                ("attr::person.status", "inactive"),
                ("attr::person.gender", "F"),
                ("attr::person.birthdate::value", "20010101"),
            ]),
            None,
        )
        .await
        .unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn fetch_honors_tag_filters() {
    let harness = provision_generic().await;
    assert_eq!(harness.store.get_profile_name(), "test_profile");
    assert_eq!(harness.store.release_number(), "release_0");
    seed_people(&harness.store).await;

    let mut session = harness.store.session(Some("test_profile")).await.unwrap();
    let hit = session
        .fetch(
            "people",
            "person1",
            Some(r#"{"attr::person.status": "active"}"#),
            false,
        )
        .await
        .unwrap()
        .expect("person1 is active");
    assert_eq!(hit.value, r#"{"name":"Alice"}"#);
    assert_eq!(hit.tag_value("attr::person.gender"), Some("F"));

    let miss = session
        .fetch(
            "people",
            "person1",
            Some(r#"{"attr::person.status": "inactive"}"#),
            false,
        )
        .await
        .unwrap();
    assert!(miss.is_none());
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn scan_pagination_is_deterministic() {
    let harness = provision_generic().await;
    seed_people(&harness.store).await;

    let scan = harness
        .store
        .scan(
            None,
            "people",
            Some(r#"{"attr::person.status": "active"}"#),
            Some(1),
            Some(1),
            None,
            false,
        )
        .await
        .unwrap();
    let entries = scan.collect_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    // Second active person in items.id order.
    assert_eq!(entries[0].name, "person2");
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn conjunctive_wql_selects_exactly() {
    let harness = provision_generic().await;
    seed_people(&harness.store).await;

    let mut session = harness.store.session(None).await.unwrap();
    let hits = session
        .fetch_all(
            "people",
            Some(
                r#"{"$and": [{"attr::person.status": "active"},
                             {"attr::person.gender": "F"}]}"#,
            ),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    let names: Vec<&str> = hits.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["person1"]);

    let either = session
        .fetch_all(
            "people",
            Some(
                r#"{"$or": [{"attr::person.gender": "M"},
                            {"attr::person.status": "inactive"}]}"#,
            ),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(either.len(), 2);

    let exists = session
        .fetch_all(
            "people",
            Some(r#"{"$exist": ["attr::person.birthdate::value"]}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(exists.len(), 3);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn replace_and_filtered_remove_all() {
    let harness = provision_generic().await;
    seed_people(&harness.store).await;

    let mut session = harness.store.session(None).await.unwrap();
    session
        .replace(
            "people",
            "person1",
            r#"{"name":"Alice","updated":true}"#,
            &tags(&[
                ("attr::person.status", "inactive"),
                ("attr::person.birthdate::value", "20020202"),
            ]),
            None,
        )
        .await
        .unwrap();
    let replaced = session
        .fetch("people", "person1", None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.value, r#"{"name":"Alice","updated":true}"#);
    assert_eq!(replaced.tags.len(), 2, "old tags must not linger");
    assert_eq!(replaced.tag_value("attr::person.gender"), None);

    // person1 (20020202) and person3 (20010101) are inactive with a
    // birthdate after 2000-01-01.
    let removed = session
        .remove_all(
            "people",
            Some(
                r#"{"$and": [{"attr::person.status": "inactive"},
                             {"attr::person.birthdate::value": {"$gt": "20000101"}}]}"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(session.count("people", None).await.unwrap(), 1);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn duplicate_insert_leaves_original_intact() {
    let harness = provision_generic().await;
    let mut session = harness.store.session(None).await.unwrap();
    session
        .insert("people", "person1", "original", &[], None)
        .await
        .unwrap();
    let err = session
        .insert("people", "person1", "other", &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Duplicate);

    let entry = session
        .fetch("people", "person1", None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, "original");
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn byte_values_round_trip_as_text() {
    let harness = provision_generic().await;
    let mut session = harness.store.session(None).await.unwrap();
    let value: &[u8] = "payload with unicode: héllo".as_bytes();
    let tag_set = tags(&[("a", "1"), ("a", "2"), ("b", "3")]);
    session
        .insert("blobs", "b1", value, &tag_set, None)
        .await
        .unwrap();
    let entry = session.fetch("blobs", "b1", None, false).await.unwrap().unwrap();
    assert_eq!(entry.value.as_bytes(), value);
    assert_eq!(entry.sorted_tags().len(), 3);

    let err = session
        .insert("blobs", "bad", [0xffu8, 0xfe].as_slice(), &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unexpected);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn profiles_are_isolated() {
    let harness = provision_generic().await;
    harness
        .store
        .create_profile(Some("tenant_b".to_string()))
        .await
        .unwrap();

    let mut a = harness.store.session(None).await.unwrap();
    a.insert("docs", "d1", "from-a", &tags(&[("owner", "a")]), None)
        .await
        .unwrap();
    a.close().await.unwrap();

    let mut b = harness.store.session(Some("tenant_b")).await.unwrap();
    // Same (category, name) is free in another profile.
    b.insert("docs", "d1", "from-b", &[], None).await.unwrap();
    let entry = b.fetch("docs", "d1", None, false).await.unwrap().unwrap();
    assert_eq!(entry.value, "from-b");
    assert_eq!(b.count("docs", None).await.unwrap(), 1);
    b.close().await.unwrap();

    // Removing tenant_b cascades to its items, not tenant a's.
    assert!(harness.store.remove_profile("tenant_b").await.unwrap());
    let mut a = harness.store.session(None).await.unwrap();
    assert_eq!(a.count("docs", None).await.unwrap(), 1);
    a.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn transactions_are_atomic() {
    let harness = provision_generic().await;

    let mut txn = harness.store.transaction(None).await.unwrap();
    assert!(txn.is_transaction());
    txn.insert("ledger", "e1", "v1", &[], None).await.unwrap();
    txn.insert("ledger", "e2", "v2", &[], None).await.unwrap();
    txn.rollback().await.unwrap();

    let mut session = harness.store.session(None).await.unwrap();
    assert_eq!(session.count("ledger", None).await.unwrap(), 0);
    session.close().await.unwrap();

    let mut txn = harness.store.transaction(None).await.unwrap();
    txn.insert("ledger", "e1", "v1", &[], None).await.unwrap();
    txn.commit().await.unwrap();

    let mut session = harness.store.session(None).await.unwrap();
    assert_eq!(session.count("ledger", None).await.unwrap(), 1);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn commit_on_session_is_a_wrapper_error() {
    let harness = provision_generic().await;
    let session = harness.store.session(None).await.unwrap();
    let err = session.commit().await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Wrapper);
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn keyset_scan_resumes_after_last_id() {
    let harness = provision_generic().await;
    let mut session = harness.store.session(None).await.unwrap();
    for i in 0..5 {
        session
            .insert("stream", &format!("rec{i}"), "v", &[], None)
            .await
            .unwrap();
    }
    session.close().await.unwrap();

    let first = harness
        .store
        .scan_keyset(None, "stream", None, None, Some(2))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    let rest = harness
        .store
        .scan_keyset(None, "stream", None, Some(first[1].id), None)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(rest.len(), 3);
    assert!(rest.iter().all(|e| e.id > first[1].id));
    harness.store.close(false).await.unwrap();
}
