//! Cross-tab propagation.
//!
//! Contexts sharing one [`StorageOrigin`](crate::medium::StorageOrigin) hear
//! about each other's writes through [`StorageEvent`]s. A [`CrossTabBridge`]
//! consumes those events for one context, keeps an in-memory cache of the
//! collections it tracks, and tells that context's observers what changed.

use std::collections::HashSet;
use std::sync::Arc;

use codex_sync_engine::{DocumentKey, Entity};
use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;

use crate::context::SyncContext;
use crate::error::Result;
use crate::medium::{StorageEvent, StorageEvents};
use crate::observer::{ChangeOrigin, Observers, SyncEvent};
use crate::store::{KeyValueStore, LocalStore};

struct BridgeInner {
    store: Arc<LocalStore>,
    observers: Observers,
    tracked: DashSet<String>,
    last_seen: DashMap<String, Option<String>>,
    cache: DashMap<DocumentKey, Entity>,
}

/// Entity cache kept current with writes from other contexts.
///
/// Writes made through this context's own store are not reported back to it.
pub struct CrossTabBridge {
    inner: Arc<BridgeInner>,
    task: JoinHandle<()>,
}

impl CrossTabBridge {
    /// Start consuming `events`, the receiver paired with `store`'s context.
    pub fn spawn(store: Arc<LocalStore>, observers: Observers, events: StorageEvents) -> Self {
        let inner = Arc::new(BridgeInner {
            store,
            observers,
            tracked: DashSet::new(),
            last_seen: DashMap::new(),
            cache: DashMap::new(),
        });
        let task = tokio::spawn(run(Arc::clone(&inner), events));
        Self { inner, task }
    }

    /// Bridge for a sync context, reporting to its observers.
    pub fn for_context(ctx: &SyncContext, events: StorageEvents) -> Self {
        Self::spawn(Arc::clone(ctx.store()), ctx.observers().clone(), events)
    }

    /// Start tracking a collection, loading its entities into the cache.
    pub async fn track(&self, collection: &str) -> Result<usize> {
        self.inner.store.keyspace().collection_prefix(collection)?;
        self.inner.tracked.insert(collection.to_string());
        let loaded = self.inner.reload(collection, false).await?;
        tracing::debug!(collection, loaded, "Tracking collection");
        Ok(loaded)
    }

    /// Stop tracking a collection and drop its cached entities.
    pub fn untrack(&self, collection: &str) {
        self.inner.tracked.remove(collection);
        self.inner.cache.retain(|key, _| key.collection != collection);
        let keys = self.inner.store.keyspace();
        self.inner
            .last_seen
            .retain(|key, _| keys.parse(key).is_some_and(|doc| doc.collection != collection));
    }

    pub fn is_tracked(&self, collection: &str) -> bool {
        self.inner.tracked.contains(collection)
    }

    pub fn cached(&self, collection: &str, id: &str) -> Option<Entity> {
        self.inner
            .cache
            .get(&DocumentKey::new(collection, id))
            .map(|entity| entity.value().clone())
    }

    /// Cached entities of a collection, ordered by ID.
    pub fn cached_collection(&self, collection: &str) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .inner
            .cache
            .iter()
            .filter(|entry| entry.key().collection == collection)
            .map(|entry| entry.value().clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }
}

impl Drop for CrossTabBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for CrossTabBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossTabBridge")
            .field("tracked", &self.inner.tracked.len())
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

async fn run(inner: Arc<BridgeInner>, mut events: StorageEvents) {
    while let Some(event) = events.recv().await {
        inner.handle(event).await;
    }
    tracing::debug!("Storage context closed, bridge stopped");
}

impl BridgeInner {
    async fn handle(&self, event: StorageEvent) {
        let Some(key) = event.key else {
            self.reload_all().await;
            return;
        };
        let Some(doc) = self.store.keyspace().parse(&key) else {
            return;
        };
        if !self.tracked.contains(&doc.collection) {
            return;
        }
        if self
            .last_seen
            .get(&key)
            .is_some_and(|seen| *seen == event.new_value)
        {
            tracing::debug!(key = %key, "Ignoring repeated storage event");
            return;
        }
        self.last_seen.insert(key.clone(), event.new_value);

        match self.store.get(&doc.collection, &doc.id).await {
            Ok(Some(entity)) => {
                let sync_version = entity.sync_version;
                self.cache.insert(doc.clone(), entity);
                self.observers.notify(SyncEvent::EntityChanged {
                    collection: doc.collection,
                    id: doc.id,
                    origin: ChangeOrigin::OtherTab,
                    sync_version,
                });
            }
            Ok(None) => {
                self.cache.remove(&doc);
                self.last_seen.remove(&key);
                self.observers.notify(SyncEvent::EntityRemoved {
                    collection: doc.collection,
                    id: doc.id,
                    origin: ChangeOrigin::OtherTab,
                });
            }
            Err(err) => {
                tracing::warn!(entity = %doc, error = %err, "Failed to re-read entity changed by another tab");
            }
        }
    }

    /// Whole store cleared by another context.
    async fn reload_all(&self) {
        self.last_seen.clear();
        self.observers.notify(SyncEvent::StoreCleared);

        let collections: Vec<String> = self.tracked.iter().map(|c| c.key().clone()).collect();
        for collection in collections {
            if let Err(err) = self.reload(&collection, true).await {
                tracing::warn!(collection = %collection, error = %err, "Failed to reload collection");
            }
        }
        tracing::info!(tracked = self.tracked.len(), "Reloaded tracked collections after clear");
    }

    /// Re-read a collection into the cache, evicting entities that are gone.
    async fn reload(&self, collection: &str, announce: bool) -> Result<usize> {
        let entities = self.store.query(collection, None).await?;
        let present: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();

        let gone: Vec<DocumentKey> = self
            .cache
            .iter()
            .filter(|entry| {
                entry.key().collection == collection && !present.contains(entry.key().id.as_str())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in gone {
            self.cache.remove(&key);
            if let Ok(storage_key) = self.store.keyspace().document_key(&key.collection, &key.id) {
                self.last_seen.remove(&storage_key);
            }
            if announce {
                self.observers.notify(SyncEvent::EntityRemoved {
                    collection: key.collection,
                    id: key.id,
                    origin: ChangeOrigin::OtherTab,
                });
            }
        }

        let count = entities.len();
        for entity in entities {
            let key = DocumentKey::new(collection, entity.id.clone());
            let changed = self
                .cache
                .get(&key)
                .map_or(true, |cached| *cached != entity);
            if announce && changed {
                self.observers.notify(SyncEvent::EntityChanged {
                    collection: collection.to_string(),
                    id: entity.id.clone(),
                    origin: ChangeOrigin::OtherTab,
                    sync_version: entity.sync_version,
                });
            }
            self.cache.insert(key, entity);
        }
        Ok(count)
    }
}
