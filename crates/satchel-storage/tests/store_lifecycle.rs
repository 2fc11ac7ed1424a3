//! Provision / open / migrate / remove lifecycle and resource limits.

use std::time::Duration;

use satchel_storage::{
    DbStore, OpenOptions, PoolOptions, ProvisionOptions, SchemaConfig, StoreErrorKind,
};
use tempfile::TempDir;

fn store_uri(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("store.db").display())
}

#[tokio::test]
async fn open_missing_store_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = DbStore::open(&store_uri(&dir), OpenOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
}

#[tokio::test]
async fn provisioned_store_reopens_with_its_data() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    let store = DbStore::provision(
        &uri,
        ProvisionOptions {
            profile: Some("wallet".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut session = store.session(None).await.unwrap();
    session.insert("docs", "d1", "persisted", &[], None).await.unwrap();
    session.close().await.unwrap();
    store.close(false).await.unwrap();

    let store = DbStore::open(&uri, OpenOptions::default()).await.unwrap();
    assert_eq!(store.get_profile_name(), "wallet");
    let mut session = store.session(None).await.unwrap();
    let entry = session.fetch("docs", "d1", None, false).await.unwrap().unwrap();
    assert_eq!(entry.value, "persisted");
    session.close().await.unwrap();
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn open_with_unknown_profile_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    DbStore::provision(&uri, ProvisionOptions::default())
        .await
        .unwrap()
        .close(false)
        .await
        .unwrap();

    let err = DbStore::open(
        &uri,
        OpenOptions {
            profile: Some("nobody".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
}

#[tokio::test]
async fn recreate_wipes_everything_but_the_default_profile() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    let store = DbStore::provision(&uri, ProvisionOptions::default()).await.unwrap();
    store.create_profile(Some("extra".to_string())).await.unwrap();
    let mut session = store.session(None).await.unwrap();
    session
        .insert("docs", "d1", "v", &[satchel_storage::EntryTag::new("t", "1")], None)
        .await
        .unwrap();
    session.close().await.unwrap();
    store.close(false).await.unwrap();

    let store = DbStore::provision(
        &uri,
        ProvisionOptions {
            profile: Some("fresh".to_string()),
            recreate: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(store.get_profile_name(), "fresh");
    let mut session = store.session(None).await.unwrap();
    assert_eq!(session.count("docs", None).await.unwrap(), 0);
    session.close().await.unwrap();
    // The pre-existing profile is gone with the rest of the store.
    let err = store.session(Some("extra")).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn generic_store_overrides_requested_release() {
    let dir = tempfile::tempdir().unwrap();
    let store = DbStore::provision(
        &store_uri(&dir),
        ProvisionOptions {
            release_number: "release_0_1".to_string(),
            schema_config: SchemaConfig::Generic,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(store.release_number(), "release_0");
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn normalized_release_transition_requires_migration() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    DbStore::provision(
        &uri,
        ProvisionOptions {
            schema_config: SchemaConfig::Normalize,
            release_number: "release_0_1".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .close(false)
    .await
    .unwrap();

    // Opening at a later release without migrating is refused.
    let err = DbStore::open(
        &uri,
        OpenOptions {
            target_release: Some("release_0_2".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unsupported);

    // Matching target is fine.
    DbStore::open(
        &uri,
        OpenOptions {
            target_release: Some("release_0_1".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .close(false)
    .await
    .unwrap();

    // After migrating, the later target opens.
    DbStore::migrate(&uri, "release_0_2").await.unwrap();
    let store = DbStore::open(
        &uri,
        OpenOptions {
            target_release: Some("release_0_2".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(store.release_number(), "release_0_2");
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn downward_migration_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    DbStore::provision(
        &uri,
        ProvisionOptions {
            schema_config: SchemaConfig::Normalize,
            release_number: "release_0_1".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .close(false)
    .await
    .unwrap();

    for target in ["release_0", "release_0_1", "release_9"] {
        let err = DbStore::migrate(&uri, target).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Unsupported, "target {target}");
    }
}

#[tokio::test]
async fn migrating_a_generic_store_projects_existing_tags() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    let store = DbStore::provision(&uri, ProvisionOptions::default()).await.unwrap();
    let mut session = store.session(None).await.unwrap();
    session
        .insert(
            "connection",
            "conn1",
            r#"{"their_label":"Bob"}"#,
            &[
                satchel_storage::EntryTag::new("state", "active"),
                satchel_storage::EntryTag::new("custom", "kept"),
            ],
            None,
        )
        .await
        .unwrap();
    session.close().await.unwrap();
    store.close(false).await.unwrap();

    DbStore::migrate(&uri, "release_0_1").await.unwrap();

    let store = DbStore::open(&uri, OpenOptions::default()).await.unwrap();
    assert_eq!(store.release_number(), "release_0_1");
    let mut session = store.session(None).await.unwrap();
    let entry = session
        .fetch("connection", "conn1", Some(r#"{"state": "active"}"#), false)
        .await
        .unwrap()
        .expect("state tag now lives in the normalized column");
    assert_eq!(entry.tag_value("custom"), Some("kept"));
    session.close().await.unwrap();
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let store = DbStore::provision(
        &store_uri(&dir),
        ProvisionOptions {
            pool: PoolOptions {
                max_sessions: Some(1),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let held = store.session(None).await.unwrap();
    let err = store.session(None).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unexpected);
    assert!(err.message.contains("maximum number of active sessions"));

    held.close().await.unwrap();
    let ok = store.session(None).await.unwrap();
    ok.close().await.unwrap();
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_surfaces_within_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let store = DbStore::provision(
        &store_uri(&dir),
        ProvisionOptions {
            pool: PoolOptions {
                max_connections: Some(1),
                acquire_timeout: Some(Duration::from_millis(200)),
                max_sessions: Some(5),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let held = store.session(None).await.unwrap();
    let err = store.create_profile(Some("p2".to_string())).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unexpected);
    assert!(err.message.contains("exhausted"));

    held.close().await.unwrap();
    store.create_profile(Some("p2".to_string())).await.unwrap();
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn rekey_on_plaintext_store_is_an_encryption_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = DbStore::provision(&store_uri(&dir), ProvisionOptions::default())
        .await
        .unwrap();
    let err = store.rekey("new-secret").await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Encryption);
    store.close(false).await.unwrap();
}

#[tokio::test]
async fn remove_deletes_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    DbStore::provision(&uri, ProvisionOptions::default())
        .await
        .unwrap()
        .close(false)
        .await
        .unwrap();

    assert!(DbStore::remove(&uri).await.unwrap());
    assert!(!DbStore::remove(&uri).await.unwrap());
    let err = DbStore::open(&uri, OpenOptions::default()).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
}

#[tokio::test]
async fn close_with_remove_drops_the_files() {
    let dir = tempfile::tempdir().unwrap();
    let uri = store_uri(&dir);
    let store = DbStore::provision(&uri, ProvisionOptions::default()).await.unwrap();
    store.close(true).await.unwrap();
    let err = DbStore::open(&uri, OpenOptions::default()).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
}

#[tokio::test]
async fn in_memory_stores_share_data_across_sessions() {
    let store = DbStore::provision("sqlite://:memory:", ProvisionOptions::default())
        .await
        .unwrap();
    let mut a = store.session(None).await.unwrap();
    a.insert("docs", "d1", "v", &[], None).await.unwrap();
    a.close().await.unwrap();
    let mut b = store.session(None).await.unwrap();
    assert!(b.fetch("docs", "d1", None, false).await.unwrap().is_some());
    b.close().await.unwrap();
    store.close(false).await.unwrap();
}
