//! Key/value entity store.
//!
//! [`KeyValueStore`] is the persistence seam the rest of the runtime talks to.
//! [`LocalStore`] implements it over a synchronous [`StorageMedium`], with one
//! storage key per entity (see [`Keyspace`]).

use std::sync::Arc;

use async_trait::async_trait;
use codex_sync_engine::{Backup, Document, Entity, Keyspace};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Result, SyncError};
use crate::latency::Latency;
use crate::medium::{MediumError, StorageMedium};
use crate::now_millis;

const AVAILABILITY_META: &str = "__storage_test__";

/// Generic collection-oriented persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Entity>>;

    /// Store an entity under `id`, stamping its local timestamps.
    async fn set(&self, collection: &str, id: &str, entity: Entity) -> Result<Entity>;

    /// Shallow-merge `partial` into a stored entity. `None` when absent.
    async fn update(&self, collection: &str, id: &str, partial: &Document) -> Result<Option<Entity>>;

    /// Every entity of a collection matching the equality filter.
    async fn query(&self, collection: &str, filter: Option<&Document>) -> Result<Vec<Entity>>;

    /// Remove an entity. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;
}

/// [`KeyValueStore`] over a local storage medium.
pub struct LocalStore {
    medium: Arc<dyn StorageMedium>,
    keys: Keyspace,
    latency: Latency,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalStore {
    pub fn new(medium: Arc<dyn StorageMedium>, keys: Keyspace, latency: Latency) -> Self {
        Self {
            medium,
            keys,
            latency,
            locks: DashMap::new(),
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    /// Exclusive access to one storage key until the returned guard drops.
    async fn lock_key(&self, key: &str) -> KeyLock<'_> {
        let mutex = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = Arc::clone(&mutex).lock_owned().await;
        KeyLock {
            locks: &self.locks,
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.medium.set_item(key, value).map_err(|err| match err {
            MediumError::QuotaExceeded { key, .. } => {
                tracing::warn!(key = %key, "Storage quota exceeded");
                SyncError::StorageQuotaExceeded { key }
            }
            MediumError::Unavailable(msg) => SyncError::StorageUnavailable(msg),
        })
    }

    /// Read and parse a stored entity. Corrupt documents read as absent.
    fn read(&self, key: &str) -> Option<Entity> {
        let raw = self.medium.get_item(key)?;
        let parsed = serde_json::from_str::<Value>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|value| match value {
                Value::Object(document) => Entity::from_document(document).map_err(|e| e.to_string()),
                other => Err(format!("expected an object, got {other}")),
            });

        match parsed {
            Ok(entity) => Some(entity),
            Err(reason) => {
                tracing::warn!(key = %key, reason = %reason, "Ignoring corrupt stored document");
                None
            }
        }
    }

    fn store(&self, key: &str, id: &str, mut entity: Entity) -> Result<Entity> {
        entity.id = id.to_string();
        entity.touch(now_millis());
        let raw = serde_json::to_string(&entity)?;
        self.write(key, &raw)?;
        Ok(entity)
    }

    /// Remove every entity of a collection. Returns how many were removed.
    pub async fn clear_collection(&self, collection: &str) -> Result<usize> {
        let prefix = self.keys.collection_prefix(collection)?;
        self.latency.wait().await;

        let keys: Vec<String> = self
            .medium
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();
        for key in &keys {
            let _lock = self.lock_key(key).await;
            self.medium.remove_item(key);
        }

        tracing::info!(collection, removed = keys.len(), "Cleared collection");
        Ok(keys.len())
    }

    /// Whether `entity` can be saved without overwriting a newer local write.
    ///
    /// `entity.updated_at_local` is the timestamp of the copy the caller
    /// started from. Saving is safe when nothing is stored yet or the stored
    /// copy is not newer than that.
    pub async fn check_save_conflict(&self, collection: &str, id: &str, entity: &Entity) -> Result<bool> {
        let key = self.keys.document_key(collection, id)?;
        self.latency.wait().await;
        Ok(self.conflict(collection, id, &key, entity).is_none())
    }

    /// Store `entity` unless another context wrote the key after the copy it
    /// was derived from. Overwriting anyway is a plain [`KeyValueStore::set`].
    pub async fn save_checked(&self, collection: &str, id: &str, entity: Entity) -> Result<Entity> {
        let key = self.keys.document_key(collection, id)?;
        let _lock = self.lock_key(&key).await;
        self.latency.wait().await;

        if let Some(conflict) = self.conflict(collection, id, &key, &entity) {
            tracing::warn!(collection, id, "Save conflict, stored copy is newer");
            return Err(conflict);
        }
        self.store(&key, id, entity)
    }

    fn conflict(&self, collection: &str, id: &str, key: &str, entity: &Entity) -> Option<SyncError> {
        let stored = self.read(key)?;
        (stored.updated_at_local > entity.updated_at_local).then(|| SyncError::SaveConflict {
            collection: collection.to_string(),
            id: id.to_string(),
            stored_at: stored.updated_at_local,
            base_at: entity.updated_at_local,
        })
    }

    /// Whether the medium accepts writes.
    pub fn is_available(&self) -> bool {
        let key = self.keys.meta_key(AVAILABILITY_META);
        match self.medium.set_item(&key, AVAILABILITY_META) {
            Ok(()) => {
                self.medium.remove_item(&key);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Local storage unavailable");
                false
            }
        }
    }

    /// Read a device-local metadata value.
    pub fn get_meta(&self, name: &str) -> Option<String> {
        self.medium.get_item(&self.keys.meta_key(name))
    }

    pub fn set_meta(&self, name: &str, value: &str) -> Result<()> {
        self.write(&self.keys.meta_key(name), value)
    }

    /// Export every key under the application prefix.
    pub fn export_backup(&self) -> Backup {
        let mut backup = Backup::new(chrono::Utc::now().to_rfc3339());
        for key in self.medium.keys() {
            if !self.keys.owns(&key) {
                continue;
            }
            if let Some(raw) = self.medium.get_item(&key) {
                backup.insert_raw(key, &raw);
            }
        }

        tracing::info!(keys = backup.len(), "Exported backup");
        backup
    }

    /// Restore keys from an exported backup. Returns how many were written.
    ///
    /// Keys outside the application prefix are skipped.
    pub fn import_backup(&self, json: &str) -> Result<usize> {
        let backup = Backup::from_json(json).map_err(|e| SyncError::InvalidBackup(e.to_string()))?;

        let mut count = 0;
        for (key, raw) in backup.raw_entries() {
            if !self.keys.owns(key) {
                tracing::debug!(key, "Skipping foreign key in backup");
                continue;
            }
            self.write(key, &raw)?;
            count += 1;
        }

        tracing::info!(count, "Imported backup");
        Ok(count)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("keys", &self.keys)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

/// Held per storage key. Dropping the last holder removes the map entry.
struct KeyLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Map entry plus our own handle; any waiter holds a third.
        self.locks.remove_if(&self.key, |_, held| {
            Arc::ptr_eq(held, &self.mutex) && Arc::strong_count(held) == 2
        });
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Entity>> {
        let key = self.keys.document_key(collection, id)?;
        self.latency.wait().await;
        Ok(self.read(&key))
    }

    async fn set(&self, collection: &str, id: &str, entity: Entity) -> Result<Entity> {
        let key = self.keys.document_key(collection, id)?;
        let _lock = self.lock_key(&key).await;
        self.latency.wait().await;

        let stored = self.store(&key, id, entity)?;
        tracing::trace!(collection, id, sync_version = stored.sync_version, "Stored entity");
        Ok(stored)
    }

    async fn update(&self, collection: &str, id: &str, partial: &Document) -> Result<Option<Entity>> {
        let key = self.keys.document_key(collection, id)?;
        let _lock = self.lock_key(&key).await;
        self.latency.wait().await;

        let Some(current) = self.read(&key) else {
            return Ok(None);
        };
        let merged = current.merged_with(partial)?;
        self.store(&key, id, merged).map(Some)
    }

    async fn query(&self, collection: &str, filter: Option<&Document>) -> Result<Vec<Entity>> {
        let prefix = self.keys.collection_prefix(collection)?;
        self.latency.wait().await;

        let entities = self
            .medium
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .filter_map(|key| self.read(&key))
            .filter(|entity| filter.map_or(true, |filter| entity.matches(filter)))
            .collect();
        Ok(entities)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let key = self.keys.document_key(collection, id)?;
        let _lock = self.lock_key(&key).await;
        self.latency.wait().await;

        let existed = self.medium.get_item(&key).is_some();
        self.medium.remove_item(&key);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::StorageOrigin;
    use serde_json::json;

    fn store_on(origin: &StorageOrigin) -> LocalStore {
        let (context, _events) = origin.open_context();
        LocalStore::new(Arc::new(context), Keyspace::default(), Latency::None)
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn entity(id: &str, payload: Value) -> Entity {
        Entity::from_payload(id, payload).unwrap()
    }

    #[tokio::test]
    async fn set_stamps_and_get_returns() {
        let store = store_on(&StorageOrigin::new());
        let stored = store
            .set("campaigns", "c1", entity("ignored", json!({"name": "Camp1"})))
            .await
            .unwrap();

        assert_eq!(stored.id, "c1");
        assert!(stored.created_at > 0);
        assert_eq!(stored.created_at, stored.updated_at_local);

        let loaded = store.get("campaigns", "c1").await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(store.get("campaigns", "c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn created_at_survives_updates() {
        let store = store_on(&StorageOrigin::new());
        let first = store
            .set("campaigns", "c1", entity("c1", json!({"name": "Camp1"})))
            .await
            .unwrap();

        let updated = store
            .update("campaigns", "c1", &doc(json!({"level": 2})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.created_at, first.created_at);
        assert_eq!(updated.payload["name"], "Camp1");
        assert_eq!(updated.payload["level"], 2);
    }

    #[tokio::test]
    async fn update_missing_returns_none() {
        let store = store_on(&StorageOrigin::new());
        let result = store
            .update("campaigns", "nope", &doc(json!({"level": 2})))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn query_filters_on_top_level_fields() {
        let store = store_on(&StorageOrigin::new());
        store
            .set("sessions", "s1", entity("s1", json!({"campaign": "c1"})))
            .await
            .unwrap();
        store
            .set("sessions", "s2", entity("s2", json!({"campaign": "c2"})))
            .await
            .unwrap();
        store
            .set("notes", "n1", entity("n1", json!({"campaign": "c1"})))
            .await
            .unwrap();

        assert_eq!(store.query("sessions", None).await.unwrap().len(), 2);
        let filtered = store
            .query("sessions", Some(&doc(json!({"campaign": "c1"}))))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "s1");
    }

    #[tokio::test]
    async fn corrupt_document_reads_as_absent() {
        let origin = StorageOrigin::new();
        let store = store_on(&origin);
        let (raw, _events) = origin.open_context();
        raw.set_item("dm_codex_doc:campaigns:c1", "{not json").unwrap();
        raw.set_item("dm_codex_doc:campaigns:c2", "[1,2]").unwrap();

        assert!(store.get("campaigns", "c1").await.unwrap().is_none());
        assert!(store.get("campaigns", "c2").await.unwrap().is_none());
        assert!(store.query("campaigns", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_and_clear_collection() {
        let store = store_on(&StorageOrigin::new());
        for id in ["a", "b", "c"] {
            store
                .set("campaigns", id, entity(id, json!({})))
                .await
                .unwrap();
        }
        store.set("sessions", "s", entity("s", json!({}))).await.unwrap();

        assert!(store.delete("campaigns", "a").await.unwrap());
        assert!(!store.delete("campaigns", "a").await.unwrap());
        assert_eq!(store.clear_collection("campaigns").await.unwrap(), 2);
        assert!(store.query("campaigns", None).await.unwrap().is_empty());
        assert_eq!(store.query("sessions", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_cannot_rewrite_version_stamp() {
        let store = store_on(&StorageOrigin::new());
        let published = entity("c1", json!({"name": "Camp1"})).with_version(3, "device_1_aaaaaaaaa");
        store.set("campaigns", "c1", published).await.unwrap();

        let updated = store
            .update(
                "campaigns",
                "c1",
                &doc(json!({"name": "Renamed", "syncVersion": 0, "deviceId": "device_9_zzzzzzzzz"})),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.sync_version, 3);
        assert_eq!(updated.device_id.as_deref(), Some("device_1_aaaaaaaaa"));
        assert_eq!(updated.payload["name"], "Renamed");
        let loaded = store.get("campaigns", "c1").await.unwrap().unwrap();
        assert_eq!(loaded.sync_version, 3);
    }

    #[tokio::test]
    async fn key_locks_are_released_after_use() {
        let store = store_on(&StorageOrigin::new());
        for id in ["a", "b"] {
            store.set("campaigns", id, entity(id, json!({}))).await.unwrap();
        }
        store
            .update("campaigns", "a", &doc(json!({"level": 1})))
            .await
            .unwrap();
        assert!(store.locks.is_empty());

        store.delete("campaigns", "a").await.unwrap();
        store.clear_collection("campaigns").await.unwrap();
        assert!(store.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn released_locks_still_serialize_writers() {
        let store = Arc::new(store_on(&StorageOrigin::new()));
        store.set("campaigns", "c1", entity("c1", json!({}))).await.unwrap();

        let writers: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut partial = Document::new();
                    partial.insert(format!("f{i}"), json!(i));
                    store.update("campaigns", "c1", &partial).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let stored = store.get("campaigns", "c1").await.unwrap().unwrap();
        assert_eq!(stored.payload.len(), 32);
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn save_checked_rejects_stale_copy() {
        let store = store_on(&StorageOrigin::new());
        let fresh = entity("c1", json!({"name": "Fresh"}));
        assert!(store.check_save_conflict("campaigns", "c1", &fresh).await.unwrap());
        let first = store.save_checked("campaigns", "c1", fresh).await.unwrap();

        // Another writer saves after `first` was read.
        let mut newer = first.clone();
        newer.payload.insert("name".into(), json!("Other tab"));
        newer.updated_at_local = first.updated_at_local + 1_000;
        let raw = serde_json::to_string(&newer).unwrap();
        store.medium.set_item("dm_codex_doc:campaigns:c1", &raw).unwrap();

        let mut stale = first.clone();
        stale.payload.insert("name".into(), json!("Mine"));
        assert!(!store.check_save_conflict("campaigns", "c1", &stale).await.unwrap());
        let err = store.save_checked("campaigns", "c1", stale).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::SaveConflict { stored_at, base_at, .. }
                if stored_at == newer.updated_at_local && base_at == first.updated_at_local
        ));
        let kept = store.get("campaigns", "c1").await.unwrap().unwrap();
        assert_eq!(kept.payload["name"], "Other tab");

        let reread = store.get("campaigns", "c1").await.unwrap().unwrap();
        let saved = store.save_checked("campaigns", "c1", reread).await.unwrap();
        assert_eq!(saved.payload["name"], "Other tab");
    }

    #[tokio::test]
    async fn availability_check_leaves_no_trace() {
        let origin = StorageOrigin::new();
        let store = store_on(&origin);
        assert!(store.is_available());
        assert_eq!(origin.used_bytes(), 0);

        let tiny = store_on(&StorageOrigin::with_quota(4));
        assert!(!tiny.is_available());
    }

    #[tokio::test]
    async fn invalid_collection_is_rejected() {
        let store = store_on(&StorageOrigin::new());
        let result = store.get("bad:collection", "x").await;
        assert!(matches!(result, Err(SyncError::Engine(_))));
    }
}
