//! End-to-end tests for normalized (release_0_1 / release_0_2) stores.

use satchel_storage::{DbStore, EntryTag, ProvisionOptions, SchemaConfig, StoreErrorKind};
use tempfile::TempDir;

fn tags(pairs: &[(&str, &str)]) -> Vec<EntryTag> {
    pairs.iter().map(|(n, v)| EntryTag::new(*n, *v)).collect()
}

struct TestStore {
    store: DbStore,
    _dir: TempDir,
}

async fn provision_normalized(release: &str) -> TestStore {
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
            schema_config: SchemaConfig::Normalize,
            release_number: release.to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    TestStore { store, _dir: dir }
}

async fn seed_connections(store: &DbStore) {
    let mut session = store.session(None).await.unwrap();
    session
        .insert(
            "connection",
            "conn1",
            r#"{"their_label":"Faber"}"#,
            &tags(&[
                ("state", "active"),
                ("their_role", "inviter"),
                ("their_did", "did:ex:faber"),
                ("custom_note", "first"),
            ]),
            None,
        )
        .await
        .unwrap();
    session
        .insert(
            "connection",
            "conn2",
            r#"{"their_label":"Acme"}"#,
            &tags(&[
                ("state", "request"),
                ("their_role", "invitee"),
                ("their_did", "did:ex:acme"),
            ]),
            None,
        )
        .await
        .unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn normalized_store_satisfies_generic_semantics() {
    let harness = provision_normalized("release_0_1").await;
    assert_eq!(harness.store.release_number(), "release_0_1");
    seed_connections(&harness.store).await;

    let mut session = harness.store.session(None).await.unwrap();

    // Filters over projected and unprojected tags compose.
    let hits = session
        .fetch_all(
            "connection",
            Some(r#"{"state": "active", "custom_note": "first"}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "conn1");
    assert_eq!(hits[0].tag_value("their_did"), Some("did:ex:faber"));

    // Duplicate detection still holds.
    let err = session
        .insert("connection", "conn1", "{}", &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Duplicate);

    // Replace is total across projected and plain tags.
    session
        .replace(
            "connection",
            "conn1",
            r#"{"their_label":"Faber","done":true}"#,
            &tags(&[("state", "completed")]),
            None,
        )
        .await
        .unwrap();
    let replaced = session
        .fetch("connection", "conn1", None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.tags, tags(&[("state", "completed")]));
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn comparators_work_against_projected_columns() {
    let harness = provision_normalized("release_0_1").await;
    seed_connections(&harness.store).await;

    let mut session = harness.store.session(None).await.unwrap();
    let requests = session
        .fetch_all(
            "connection",
            Some(r#"{"state": {"$in": ["request", "invitation"]}}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "conn2");

    let with_did = session
        .fetch_all(
            "connection",
            Some(r#"{"their_did": {"$like": "did:ex:%"}, "$exist": ["their_role"]}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(with_did.len(), 2);

    let not_active = session
        .fetch_all(
            "connection",
            Some(r#"{"$not": {"state": "active"}}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(not_active.len(), 1);
    assert_eq!(not_active[0].name, "conn2");
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn remove_all_counts_normalized_matches() {
    let harness = provision_normalized("release_0_1").await;
    seed_connections(&harness.store).await;

    let mut session = harness.store.session(None).await.unwrap();
    let removed = session
        .remove_all("connection", Some(r#"{"state": "request"}"#))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(session.count("connection", None).await.unwrap(), 1);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn unknown_categories_fall_back_to_the_default_handler() {
    let harness = provision_normalized("release_0_1").await;
    let mut session = harness.store.session(None).await.unwrap();
    session
        .insert("people", "p1", "{}", &tags(&[("status", "active")]), None)
        .await
        .unwrap();
    let entry = session
        .fetch("people", "p1", Some(r#"{"status": "active"}"#), false)
        .await
        .unwrap();
    assert!(entry.is_some());
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn release_0_2_normalizes_cred_ex_records() {
    let harness = provision_normalized("release_0_2").await;
    assert_eq!(harness.store.release_number(), "release_0_2");

    let mut session = harness.store.session(None).await.unwrap();
    session
        .insert(
            "cred_ex_v20",
            "cx1",
            r#"{"cred_preview":{}}"#,
            &tags(&[
                ("state", "offer-sent"),
                ("thread_id", "th-1"),
                ("connection_id", "conn1"),
            ]),
            None,
        )
        .await
        .unwrap();
    session
        .insert(
            "connection",
            "conn1",
            "{}",
            &tags(&[("state", "active"), ("connection_protocol", "didexchange/1.1")]),
            None,
        )
        .await
        .unwrap();

    let by_thread = session
        .fetch_all(
            "cred_ex_v20",
            Some(r#"{"thread_id": "th-1"}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(by_thread.len(), 1);

    // connection_protocol is a projected column at this release.
    let by_protocol = session
        .fetch_all(
            "connection",
            Some(r#"{"connection_protocol": {"$like": "didexchange/%"}}"#),
            None,
            false,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(by_protocol.len(), 1);
    session.close().await.unwrap();
    harness.store.close(false).await.unwrap();
}

#[tokio::test]
async fn scan_streams_normalized_entries() {
    let harness = provision_normalized("release_0_1").await;
    seed_connections(&harness.store).await;

    let entries = harness
        .store
        .scan(None, "connection", Some(r#"{"$exist": ["state"]}"#), None, None, None, false)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].id < entries[1].id);
    harness.store.close(false).await.unwrap();
}
