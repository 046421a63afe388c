//! Database sync pipeline and match database refresh

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use kiosk_agent::error::AgentError;
use kiosk_agent::matching::{encode_index, MatchDatabase};
use kiosk_agent::store::LocalStore;
use kiosk_agent::sync::database::staged;
use kiosk_agent::sync::{DatabaseSyncOutcome, DatabaseSyncPipeline};
use kiosk_common::config::SyncConfig;
use kiosk_common::hash::sha256_hex;
use kiosk_common::models::DatabaseKind;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use helpers::{fast_policy, MockAuthority};

struct Fixture {
    authority: MockAuthority,
    _dir: TempDir,
    store: Arc<LocalStore>,
    pipeline: DatabaseSyncPipeline,
}

async fn fixture() -> Fixture {
    let authority = MockAuthority::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::new(dir.path()).unwrap());
    let pipeline = DatabaseSyncPipeline::new(
        authority.client(),
        store.clone(),
        dir.path(),
        fast_policy(),
        &SyncConfig::default(),
    )
    .unwrap();
    Fixture {
        authority,
        _dir: dir,
        store,
        pipeline,
    }
}

fn safety_index() -> Vec<u8> {
    encode_index(3, &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
}

fn publish(f: &Fixture, token: &str, bytes: &[u8]) {
    f.authority
        .state
        .publish_database("safety", token, bytes, &sha256_hex(bytes));
}

#[tokio::test]
async fn test_unpublished_database_is_skipped() {
    let f = fixture().await;

    let outcome = f.pipeline.sync_kind(DatabaseKind::Loyalty).await.unwrap();

    assert_eq!(outcome, DatabaseSyncOutcome::NotPublished);
    assert!(f.store.load_db_version(DatabaseKind::Loyalty).is_none());
    assert!(!f.pipeline.index_path(DatabaseKind::Loyalty).exists());
    assert_eq!(f.authority.state.hits("db_download:loyalty"), 0);
}

#[tokio::test]
async fn test_verified_download_is_recorded_with_metadata() {
    let f = fixture().await;
    let bytes = safety_index();
    publish(&f, "2024-06-01", &bytes);
    let records = vec![json!({"case_reference": "C-1"}), json!({"case_reference": "C-2"})];
    f.authority.state.publish_metadata("safety", records.clone());

    let outcome = f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();

    let DatabaseSyncOutcome::Updated(record) = outcome else {
        panic!("expected update, got {:?}", outcome);
    };
    assert_eq!(record.version_token, "2024-06-01");
    assert_eq!(record.file_hash, sha256_hex(&bytes));
    assert_eq!(f.store.load_db_version(DatabaseKind::Safety), Some(record));
    assert_eq!(std::fs::read(f.pipeline.index_path(DatabaseKind::Safety)).unwrap(), bytes);

    let stored: Vec<Value> = serde_json::from_slice(
        &std::fs::read(f.pipeline.metadata_path(DatabaseKind::Safety)).unwrap(),
    )
    .unwrap();
    assert_eq!(stored, records);
}

#[tokio::test]
async fn test_missing_metadata_is_synthesized_empty() {
    let f = fixture().await;
    publish(&f, "v1", &safety_index());

    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();

    let stored: Vec<Value> = serde_json::from_slice(
        &std::fs::read(f.pipeline.metadata_path(DatabaseKind::Safety)).unwrap(),
    )
    .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_matching_hash_is_up_to_date() {
    let f = fixture().await;
    publish(&f, "v1", &safety_index());
    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();

    let outcome = f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();

    assert_eq!(outcome, DatabaseSyncOutcome::UpToDate);
    assert_eq!(f.authority.state.hits("db_download:safety"), 1);
}

#[tokio::test]
async fn test_corrupt_download_keeps_previous_version() {
    let f = fixture().await;
    let v1 = safety_index();
    publish(&f, "v1", &v1);
    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();
    let recorded = f.store.load_db_version(DatabaseKind::Safety).unwrap();

    // Advertise v2's hash but serve something else
    let v2 = encode_index(3, &[vec![0.0, 0.0, 1.0]]);
    f.authority
        .state
        .publish_database("safety", "v2", b"garbage", &sha256_hex(&v2));

    let err = f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap_err();

    assert!(matches!(err, AgentError::Integrity { .. }), "{:?}", err);
    assert_eq!(f.authority.state.hits("db_download:safety"), 2);
    assert_eq!(f.store.load_db_version(DatabaseKind::Safety), Some(recorded));
    assert_eq!(std::fs::read(f.pipeline.index_path(DatabaseKind::Safety)).unwrap(), v1);
    let index_path = f.pipeline.index_path(DatabaseKind::Safety);
    assert!(!staged(&index_path).exists());
    assert!(!index_path.with_file_name(".safety.index.next.part").exists());

    let status = f.pipeline.status();
    let safety = status.iter().find(|s| s.kind == DatabaseKind::Safety).unwrap();
    assert_eq!(safety.consecutive_failures, 1);
    assert_eq!(safety.version_token.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_malformed_version_descriptor_is_rejected() {
    let f = fixture().await;
    f.authority
        .state
        .publish_database("safety", "v1", &safety_index(), "not-a-hash");

    let err = f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap_err();

    assert!(matches!(err, AgentError::InvalidPayload(_)), "{:?}", err);
    assert_eq!(f.authority.state.hits("db_download:safety"), 0);
}

#[tokio::test]
async fn test_match_database_follows_new_generation() {
    let f = fixture().await;
    publish(&f, "v1", &safety_index());
    f.authority.state.publish_metadata(
        "safety",
        vec![json!({"case_reference": "C-1"}), json!({"case_reference": "C-2"})],
    );
    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();

    let db = MatchDatabase::new(DatabaseKind::Safety, 0.9, 5);
    assert!(db.search(&[1.0, 0.0, 0.0]).unwrap().is_empty());
    assert!(db.refresh(&f.pipeline).await.unwrap());
    assert!(!db.refresh(&f.pipeline).await.unwrap());

    let hits = db.search(&[0.0, 1.0, 0.0]).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata["case_reference"], "C-2");

    let v2 = encode_index(3, &[vec![0.0, 0.0, 1.0]]);
    publish(&f, "v2", &v2);
    f.authority
        .state
        .publish_metadata("safety", vec![json!({"case_reference": "C-3"})]);
    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();
    assert!(db.refresh(&f.pipeline).await.unwrap());

    assert_eq!(db.generation().unwrap().version_token(), "v2");
    assert!(db.search(&[0.0, 1.0, 0.0]).unwrap().is_empty());
    assert_eq!(db.search(&[0.0, 0.0, 1.0]).unwrap()[0].metadata["case_reference"], "C-3");
}

#[tokio::test]
async fn test_metadata_failure_leaves_previous_pair_in_place() {
    let f = fixture().await;
    let v1 = safety_index();
    publish(&f, "v1", &v1);
    f.authority
        .state
        .publish_metadata("safety", vec![json!({"case_reference": "C-1"})]);
    f.pipeline.sync_kind(DatabaseKind::Safety).await.unwrap();
    let recorded = f.store.load_db_version(DatabaseKind::Safety).unwrap();
    let metadata_path = f.pipeline.metadata_path(DatabaseKind::Safety);
    let metadata_v1 = std::fs::read(&metadata_path).unwrap();

    // A non-empty directory where the staged metadata goes makes its write fail
    let blocker = staged(&metadata_path);
    std::fs::create_dir_all(blocker.join("occupied")).unwrap();
    let v2 = encode_index(3, &[vec![0.0, 0.0, 1.0]]);
    publish(&f, "v2", &v2);

    assert!(f.pipeline.sync_kind(DatabaseKind::Safety).await.is_err());

    let index_path = f.pipeline.index_path(DatabaseKind::Safety);
    assert_eq!(std::fs::read(&index_path).unwrap(), v1);
    assert!(!staged(&index_path).exists());
    assert_eq!(std::fs::read(&metadata_path).unwrap(), metadata_v1);
    assert_eq!(f.store.load_db_version(DatabaseKind::Safety), Some(recorded));

    let db = MatchDatabase::new(DatabaseKind::Safety, 0.9, 5);
    assert!(db.refresh(&f.pipeline).await.unwrap());
    assert_eq!(db.generation().unwrap().version_token(), "v1");
}

#[tokio::test]
async fn test_sync_request_during_cycle_is_not_lost() {
    let f = fixture().await;
    publish(&f, "v1", &safety_index());
    let pipeline = Arc::new(f.pipeline);

    // Requested before the loops reach their first wait
    pipeline.sync_now();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.clone().run(cancel.clone()));

    // Intervals are hours; a second check can only come from the request
    for _ in 0..200 {
        if f.authority.state.hits("db_version:safety") >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert!(f.authority.state.hits("db_version:safety") >= 2);
    assert!(f.authority.state.hits("db_version:loyalty") >= 2);
    assert_eq!(f.authority.state.hits("db_download:safety"), 1);
}
