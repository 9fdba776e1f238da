//! Local persistence: quota, backups and configuration.

mod support;

use std::sync::Arc;

use codex_sync::{
    ConfigError, KeyValueStore, Latency, LocalStore, StorageMedium, StorageOrigin, SyncConfig,
    SyncError,
};
use codex_sync_engine::{Keyspace, DEFAULT_PREFIX};
use serde_json::json;
use support::{campaign, init_tracing};

const CAMPAIGNS: &str = "campaigns";

fn store_on(origin: &StorageOrigin) -> LocalStore {
    let (context, _events) = origin.open_context();
    LocalStore::new(Arc::new(context), Keyspace::default(), Latency::None)
}

// ============================================================================
// Quota
// ============================================================================

#[tokio::test]
async fn test_quota_exceeded_leaves_previous_value() {
    init_tracing();
    let origin = StorageOrigin::with_quota(512);
    let store = store_on(&origin);

    store.set(CAMPAIGNS, "camp-1", campaign("camp-1", "Small")).await.unwrap();
    let used_before = origin.used_bytes();

    let huge = codex_sync_engine::Entity::from_payload("camp-1", json!({ "notes": "x".repeat(2048) })).unwrap();
    let err = store.set(CAMPAIGNS, "camp-1", huge).await.unwrap_err();
    assert!(matches!(err, SyncError::StorageQuotaExceeded { .. }));

    let stored = store.get(CAMPAIGNS, "camp-1").await.unwrap().unwrap();
    assert_eq!(stored.payload["name"], "Small");
    assert_eq!(origin.used_bytes(), used_before);
}

#[tokio::test]
async fn test_quota_exceeded_update_is_not_applied() {
    let origin = StorageOrigin::with_quota(512);
    let store = store_on(&origin);
    store.set(CAMPAIGNS, "camp-1", campaign("camp-1", "Small")).await.unwrap();

    let mut partial = serde_json::Map::new();
    partial.insert("notes".into(), json!("y".repeat(2048)));
    let result = store.update(CAMPAIGNS, "camp-1", &partial).await;
    assert!(matches!(result, Err(SyncError::StorageQuotaExceeded { .. })));

    let stored = store.get(CAMPAIGNS, "camp-1").await.unwrap().unwrap();
    assert!(stored.payload.get("notes").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_to_one_key_are_serialized() {
    let origin = StorageOrigin::new();
    let store = Arc::new(store_on(&origin));
    let seed = codex_sync_engine::Entity::from_payload("camp-1", json!({})).unwrap();
    store.set(CAMPAIGNS, "camp-1", seed).await.unwrap();

    let writers: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut partial = serde_json::Map::new();
                partial.insert(format!("field{i}"), json!(i));
                store.update(CAMPAIGNS, "camp-1", &partial).await.unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let stored = store.get(CAMPAIGNS, "camp-1").await.unwrap().unwrap();
    assert_eq!(stored.payload.len(), 16);
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn test_backup_round_trip_between_origins() {
    let source = store_on(&StorageOrigin::new());
    source.set(CAMPAIGNS, "camp-1", campaign("camp-1", "One")).await.unwrap();
    source.set(CAMPAIGNS, "camp-2", campaign("camp-2", "Two")).await.unwrap();
    source.set_meta("theme", "dark").unwrap();

    let backup = source.export_backup();
    assert_eq!(backup.len(), 3);
    let json = backup.to_json().unwrap();

    let target_origin = StorageOrigin::new();
    let target = store_on(&target_origin);
    assert_eq!(target.import_backup(&json).unwrap(), 3);

    let restored = target.query(CAMPAIGNS, None).await.unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(target.get_meta("theme").as_deref(), Some("dark"));
}

#[tokio::test]
async fn test_backup_skips_foreign_keys() {
    let origin = StorageOrigin::new();
    let (raw, _events) = origin.open_context();
    raw.set_item("other_app_key", "value").unwrap();
    let store = store_on(&origin);
    store.set(CAMPAIGNS, "camp-1", campaign("camp-1", "One")).await.unwrap();

    let backup = store.export_backup();
    assert_eq!(backup.len(), 1);

    let foreign = json!({
        "version": "1.0",
        "timestamp": "2024-01-01T00:00:00Z",
        "store": {
            "other_app_key": "x",
            format!("{DEFAULT_PREFIX}meta:theme"): "light",
        }
    });
    let target = store_on(&StorageOrigin::new());
    assert_eq!(target.import_backup(&foreign.to_string()).unwrap(), 1);
    assert_eq!(target.get_meta("theme").as_deref(), Some("light"));
}

#[test]
fn test_corrupt_backup_is_rejected() {
    let store = store_on(&StorageOrigin::new());
    for input in ["not json", "{}", r#"{"store": []}"#] {
        let err = store.import_backup(input).unwrap_err();
        assert!(matches!(err, SyncError::InvalidBackup(_)), "input {input}");
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_from_lookup() {
    let config = SyncConfig::from_lookup(|var| match var {
        "CODEX_SYNC_PREFIX" => Some("test_".into()),
        "CODEX_SYNC_QUEUE_CAPACITY" => Some("10".into()),
        _ => None,
    })
    .unwrap();
    assert_eq!(config.key_prefix, "test_");
    assert_eq!(config.queue_capacity, 10);
    assert_eq!(config.queue_warn_threshold, SyncConfig::default().queue_warn_threshold);

    let err = SyncConfig::from_lookup(|var| {
        (var == "CODEX_SYNC_REMOTE_TIMEOUT_MS").then(|| "soon".to_string())
    })
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { var: "CODEX_SYNC_REMOTE_TIMEOUT_MS", .. }));
}
