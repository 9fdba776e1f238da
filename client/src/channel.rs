//! Remote mirroring of local entities.
//!
//! A [`SyncChannel`] does three things for one device:
//!
//! 1. **Publish**: pushes local entities to the remote store, stamping a new
//!    sync version, or queues them when sync is unavailable
//! 2. **Listen**: keeps one live subscription per tracked entity and settles
//!    every remote delivery through the [`ConflictResolver`]
//! 3. **Recover**: when sync becomes available again, replays the pending
//!    queue and restarts the listeners that were wanted
//!
//! ## Listener lifecycle
//!
//! ```text
//! Unsubscribed -> Subscribing -> Live -> Unsubscribed   (stop)
//!                                Live -> Error -> Unsubscribed   (transport failure)
//! ```
//!
//! Every registration carries a generation number. Stopping or restarting a
//! listener removes its registration, so a delivery that was already in flight
//! for the old generation finds itself stale and is dropped before it touches
//! local state.
//!
//! [`ConflictResolver`]: codex_sync_engine::ConflictResolver

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use codex_sync_engine::{
    DeviceId, DocumentKey, EnqueueOutcome, Entity, PendingOperation, QueueReason, Resolution,
    UserId, VersionStamp,
};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::now_millis;
use crate::observer::{ChangeOrigin, SyncEvent};
use crate::remote::{RemoteChange, Subscription};
use crate::store::KeyValueStore;

/// State of the listener for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenerState {
    Unsubscribed,
    Subscribing,
    Live,
    Error,
}

/// What a publish did.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Written to the remote store; carries the entity as now stored locally
    Published(Entity),
    /// Buffered for replay
    Queued(QueueReason),
    /// A newer remote version replaced the local edit; carries the remote
    /// version as now stored locally
    Superseded(Entity),
    /// The remote store already holds this content from this device
    AlreadyPublished,
}

/// Snapshot of the device's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub authenticated: bool,
    pub user_id: Option<UserId>,
    pub online: bool,
    pub device_id: DeviceId,
    pub pending_syncs: usize,
    pub active_listeners: usize,
}

#[derive(Debug)]
struct Registration {
    generation: u64,
    state: ListenerState,
    task: Option<JoinHandle<()>>,
    last_applied: Option<VersionStamp>,
}

impl Registration {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            state: ListenerState::Subscribing,
            task: None,
            last_applied: None,
        }
    }
}

struct ChannelInner {
    ctx: Arc<SyncContext>,
    registrations: DashMap<DocumentKey, Registration>,
    desired: DashSet<DocumentKey>,
    generations: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Serializes read-resolve-write cycles per entity.
    entity_locks: DashMap<DocumentKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Publishes, listens and recovers for one device.
///
/// Cheap to clone; clones share listeners and the availability watcher.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<ChannelInner>,
}

impl SyncChannel {
    /// Create a channel. Listeners are not restarted automatically until
    /// [`watch_availability`](Self::watch_availability) is called.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                ctx,
                registrations: DashMap::new(),
                desired: DashSet::new(),
                generations: AtomicU64::new(0),
                watcher: Mutex::new(None),
                entity_locks: DashMap::new(),
            }),
        }
    }

    /// Create a channel and start its availability watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(ctx: Arc<SyncContext>) -> Self {
        let channel = Self::new(ctx);
        channel.watch_availability();
        channel
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.inner.ctx
    }

    /// Start reacting to sign-in, connectivity and preference changes: drain
    /// the queue and restart wanted listeners when sync becomes available,
    /// stop live listeners when it goes away.
    pub fn watch_availability(&self) {
        let mut slot = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let ctx = &self.inner.ctx;
        let auth = ctx.auth().changes();
        let online = ctx.online_changes();
        let enabled = ctx.sync_enabled_changes();
        let available = ctx.is_available();

        *slot = Some(tokio::spawn(watch_availability(
            Arc::downgrade(&self.inner),
            auth,
            online,
            enabled,
            available,
        )));
    }

    /// Listen to remote changes of one entity.
    ///
    /// Any previous listener for the entity is torn down first. While sync is
    /// unavailable the entity is only remembered and its listener starts once
    /// sync becomes available.
    pub async fn start_listening(&self, collection: &str, id: &str) -> Result<()> {
        self.inner.start_listening(collection, id).await
    }

    /// Stop listening to one entity.
    pub fn stop_listening(&self, collection: &str, id: &str) {
        let key = DocumentKey::new(collection, id);
        self.inner.desired.remove(&key);
        self.inner.teardown(&key);
    }

    /// Stop every listener and forget them.
    pub fn stop_all(&self) {
        self.inner.desired.clear();
        self.inner.stop_live();
    }

    pub fn listener_state(&self, collection: &str, id: &str) -> ListenerState {
        self.inner
            .registrations
            .get(&DocumentKey::new(collection, id))
            .map(|reg| reg.state)
            .unwrap_or(ListenerState::Unsubscribed)
    }

    /// Number of live listeners.
    pub fn active_listeners(&self) -> usize {
        self.inner.active_listeners()
    }

    /// Push a local entity to the remote store.
    pub async fn publish(&self, collection: &str, entity: Entity) -> Result<PublishOutcome> {
        self.inner.publish(collection, entity).await
    }

    /// Store an entity locally, then publish it.
    pub async fn commit(&self, collection: &str, entity: Entity) -> Result<PublishOutcome> {
        let id = entity.id.clone();
        let stored = self.inner.ctx.store().set(collection, &id, entity).await?;
        self.inner.publish(collection, stored).await
    }

    /// Replay the pending queue, collapsed per entity, oldest first.
    pub async fn drain(&self) -> Vec<PublishOutcome> {
        self.inner.drain().await
    }

    /// Load one entity from the remote store.
    pub async fn fetch_remote(&self, collection: &str, id: &str) -> Result<Option<Entity>> {
        let ctx = &self.inner.ctx;
        ctx.keyspace().document_key(collection, id)?;
        if let Some(reason) = ctx.unavailable_reason() {
            return Err(reason.into());
        }

        let Some(value) = ctx
            .remote_call(ctx.remote().get_document(collection, id))
            .await?
        else {
            return Ok(None);
        };

        ctx.schema()
            .validate_remote(collection, id, &value)
            .map(Some)
            .map_err(|err| SyncError::MalformedRemoteData {
                collection: collection.to_string(),
                id: id.to_string(),
                reason: err.to_string(),
            })
    }

    /// Every entity of a collection published by the signed-in user.
    ///
    /// Malformed documents are skipped.
    pub async fn list_remote_for_user(&self, collection: &str) -> Result<Vec<Entity>> {
        let ctx = &self.inner.ctx;
        ctx.keyspace().collection_prefix(collection)?;
        if let Some(reason) = ctx.unavailable_reason() {
            return Err(reason.into());
        }
        let user_id = ctx.current_user_id().ok_or(SyncError::AuthRequired)?;

        let documents = ctx
            .remote_call(ctx.remote().query_by_field(
                collection,
                "userId",
                &Value::String(user_id),
            ))
            .await?;

        let mut entities = Vec::with_capacity(documents.len());
        for value in documents {
            let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) else {
                tracing::warn!(collection, "Skipping remote document without id");
                continue;
            };
            match ctx.schema().validate_remote(collection, &id, &value) {
                Ok(entity) => entities.push(entity),
                Err(err) => {
                    tracing::warn!(collection, id = %id, error = %err, "Skipping malformed remote document");
                }
            }
        }

        tracing::debug!(collection, count = entities.len(), "Listed remote entities");
        Ok(entities)
    }

    /// Delete one entity from the remote store. Returns whether it existed.
    pub async fn delete_remote(&self, collection: &str, id: &str) -> Result<bool> {
        let ctx = &self.inner.ctx;
        ctx.keyspace().document_key(collection, id)?;
        if let Some(reason) = ctx.unavailable_reason() {
            return Err(reason.into());
        }

        let existed = ctx
            .remote_call(ctx.remote().delete_document(collection, id))
            .await?;
        tracing::info!(collection, id, existed, "Deleted remote entity");
        Ok(existed)
    }

    pub async fn status(&self) -> SyncStatus {
        let ctx = &self.inner.ctx;
        let user_id = ctx.current_user_id();
        SyncStatus {
            enabled: ctx.is_sync_enabled(),
            authenticated: user_id.is_some(),
            user_id,
            online: ctx.is_online(),
            device_id: ctx.device_id().to_string(),
            pending_syncs: ctx.pending_count().await,
            active_listeners: self.active_listeners(),
        }
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("device_id", &self.inner.ctx.device_id())
            .field("listeners", &self.inner.registrations.len())
            .finish()
    }
}

impl ChannelInner {
    fn is_current(&self, key: &DocumentKey, generation: u64) -> bool {
        self.registrations
            .get(key)
            .is_some_and(|reg| reg.generation == generation)
    }

    fn active_listeners(&self) -> usize {
        self.registrations
            .iter()
            .filter(|reg| reg.state == ListenerState::Live)
            .count()
    }

    fn emit_state(&self, key: &DocumentKey, state: ListenerState) {
        self.ctx.observers().notify(SyncEvent::ListenerStateChanged {
            collection: key.collection.clone(),
            id: key.id.clone(),
            state,
        });
    }

    /// Move a registration to `state` if it still belongs to `generation`.
    fn set_state(&self, key: &DocumentKey, generation: u64, state: ListenerState) -> bool {
        let updated = match self.registrations.get_mut(key) {
            Some(mut reg) if reg.generation == generation => {
                reg.state = state;
                true
            }
            _ => false,
        };
        if updated {
            self.emit_state(key, state);
        }
        updated
    }

    async fn start_listening(self: &Arc<Self>, collection: &str, id: &str) -> Result<()> {
        self.ctx.keyspace().document_key(collection, id)?;
        let key = DocumentKey::new(collection, id);
        self.desired.insert(key.clone());
        self.teardown(&key);

        if let Some(reason) = self.ctx.unavailable_reason() {
            tracing::debug!(collection, id, ?reason, "Listener deferred until sync is available");
            return Ok(());
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.registrations
            .insert(key.clone(), Registration::new(generation));
        self.emit_state(&key, ListenerState::Subscribing);

        let subscription = match self
            .ctx
            .remote_call(self.ctx.remote().subscribe(collection, id))
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(collection, id, error = %err, "Failed to start listener");
                self.fail(&key, generation);
                return Err(err);
            }
        };

        let task = tokio::spawn(consume(
            Arc::downgrade(self),
            key.clone(),
            generation,
            subscription,
        ));

        let live = match self.registrations.get_mut(&key) {
            Some(mut reg) if reg.generation == generation => {
                reg.task = Some(task);
                reg.state = ListenerState::Live;
                true
            }
            _ => {
                // Stopped while subscribing.
                task.abort();
                false
            }
        };

        if live {
            self.emit_state(&key, ListenerState::Live);
            tracing::info!(collection, id, generation, "Listening for remote changes");
        }
        Ok(())
    }

    /// Remove a registration and abort its consumer. Returns whether one existed.
    fn teardown(&self, key: &DocumentKey) -> bool {
        let Some((_, reg)) = self.registrations.remove(key) else {
            return false;
        };
        if let Some(task) = reg.task {
            task.abort();
        }

        self.emit_state(key, ListenerState::Unsubscribed);
        tracing::info!(
            collection = %key.collection,
            id = %key.id,
            generation = reg.generation,
            "Stopped listening"
        );
        true
    }

    /// Stop every live listener, keeping the set of wanted ones.
    fn stop_live(&self) {
        let keys: Vec<DocumentKey> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.teardown(&key);
        }
    }

    /// Transport failure: `Error`, then release the handle and go `Unsubscribed`.
    fn fail(&self, key: &DocumentKey, generation: u64) {
        if !self.set_state(key, generation, ListenerState::Error) {
            return;
        }
        if self
            .registrations
            .remove_if(key, |_, reg| reg.generation == generation)
            .is_some()
        {
            self.emit_state(key, ListenerState::Unsubscribed);
        }
    }

    async fn restart_desired(self: &Arc<Self>) {
        let keys: Vec<DocumentKey> = self.desired.iter().map(|key| key.key().clone()).collect();
        let starts = keys
            .iter()
            .map(|key| self.start_listening(&key.collection, &key.id));
        let results = futures::future::join_all(starts).await;

        for (key, result) in keys.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(
                    collection = %key.collection,
                    id = %key.id,
                    error = %err,
                    "Failed to restart listener"
                );
            }
        }
    }

    fn already_applied(&self, key: &DocumentKey, generation: u64, stamp: &VersionStamp) -> bool {
        self.registrations.get(key).is_some_and(|reg| {
            reg.generation == generation && reg.last_applied.as_ref() == Some(stamp)
        })
    }

    /// Record a delivered stamp. False if the registration went stale.
    fn record_applied(&self, key: &DocumentKey, generation: u64, stamp: VersionStamp) -> bool {
        match self.registrations.get_mut(key) {
            Some(mut reg) if reg.generation == generation => {
                reg.last_applied = Some(stamp);
                true
            }
            _ => false,
        }
    }

    fn notify_changed(&self, collection: &str, entity: &Entity) {
        self.ctx.observers().notify(SyncEvent::EntityChanged {
            collection: collection.to_string(),
            id: entity.id.clone(),
            origin: ChangeOrigin::Remote,
            sync_version: entity.sync_version,
        });
    }

    fn entity_lock(&self, key: &DocumentKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.entity_locks.entry(key.clone()).or_default().value())
    }

    /// Drop the lock entry once no other task holds or waits on it. The
    /// caller must have released its guard but still own `lock`.
    fn release_entity_lock(&self, key: &DocumentKey, lock: Arc<tokio::sync::Mutex<()>>) {
        self.entity_locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }

    async fn handle_remote(&self, key: &DocumentKey, generation: u64, value: Value) {
        let lock = self.entity_lock(key);
        let republish = {
            let _guard = lock.lock().await;
            self.settle_remote(key, generation, value).await
        };
        self.release_entity_lock(key, lock);

        let Some(local) = republish else {
            return;
        };
        let (collection, id) = (key.collection.as_str(), key.id.as_str());
        match self.publish(collection, local).await {
            Ok(outcome) => tracing::debug!(collection, id, ?outcome, "Re-published local copy"),
            Err(err) => tracing::warn!(collection, id, error = %err, "Failed to re-publish local copy"),
        }
    }

    /// Apply a remote delivery under the entity lock. Returns the local copy
    /// when it is newer and has to be published again.
    async fn settle_remote(&self, key: &DocumentKey, generation: u64, value: Value) -> Option<Entity> {
        let (collection, id) = (key.collection.as_str(), key.id.as_str());

        let remote = match self.ctx.schema().validate_remote(collection, id, &value) {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(collection, id, error = %err, "Discarding malformed remote data");
                return None;
            }
        };

        let store = self.ctx.store();
        let local = match store.get(collection, id).await {
            Ok(local) => local,
            Err(err) => {
                tracing::warn!(collection, id, error = %err, "Failed to read local copy");
                return None;
            }
        };

        let decision = self.ctx.resolver().resolve(local.as_ref(), &remote);
        match decision.resolution {
            Resolution::ApplyRemote => {
                if decision.is_tie() {
                    tracing::info!(
                        collection,
                        id,
                        sync_version = remote.sync_version,
                        remote_device = ?remote.device_id,
                        "Equal-version conflict, remote device wins"
                    );
                }

                let stamp = remote.stamp();
                if self.already_applied(key, generation, &stamp) {
                    tracing::debug!(collection, id, sync_version = stamp.sync_version, "Duplicate delivery");
                    return None;
                }
                if !self.is_current(key, generation) {
                    return None;
                }

                let stored = match store.set(collection, id, remote).await {
                    Ok(stored) => stored,
                    Err(err) => {
                        tracing::warn!(collection, id, error = %err, "Failed to apply remote update");
                        return None;
                    }
                };
                if !self.record_applied(key, generation, stamp) {
                    tracing::debug!(collection, id, generation, "Listener stopped during apply");
                    return None;
                }

                self.notify_changed(collection, &stored);
                tracing::info!(collection, id, sync_version = stored.sync_version, "Applied remote update");
            }
            Resolution::KeepLocal => {
                let local = local?;
                tracing::info!(
                    collection,
                    id,
                    local_version = local.sync_version,
                    remote_version = remote.sync_version,
                    "Local copy is newer, re-publishing"
                );
                return Some(local);
            }
            Resolution::NoOp if decision.is_tie() => {
                tracing::info!(
                    collection,
                    id,
                    sync_version = remote.sync_version,
                    remote_device = ?remote.device_id,
                    "Equal-version conflict, local device wins"
                );
            }
            Resolution::NoOp => {
                tracing::trace!(collection, id, reason = ?decision.reason, "Ignoring remote delivery");
            }
        }
        None
    }

    async fn publish(&self, collection: &str, entity: Entity) -> Result<PublishOutcome> {
        let id = entity.id.clone();
        self.ctx.keyspace().document_key(collection, &id)?;

        if let Some(reason) = self.ctx.unavailable_reason() {
            return self.enqueue(collection, entity, reason).await;
        }

        let key = DocumentKey::new(collection, id);
        let lock = self.entity_lock(&key);
        let outcome = {
            let _guard = lock.lock().await;
            self.publish_locked(collection, entity).await
        };
        self.release_entity_lock(&key, lock);
        outcome
    }

    /// Read the remote copy, resolve and write. Runs under the entity lock
    /// so two publishes of one entity never stamp the same version.
    async fn publish_locked(&self, collection: &str, entity: Entity) -> Result<PublishOutcome> {
        let id = entity.id.clone();

        let remote_value = match self
            .ctx
            .remote_call(self.ctx.remote().get_document(collection, &id))
            .await
        {
            Ok(value) => value,
            Err(err) => return self.enqueue_or_fail(collection, entity, err).await,
        };

        let remote = remote_value.and_then(|value| {
            match self.ctx.schema().validate_remote(collection, &id, &value) {
                Ok(remote) => Some(remote),
                Err(err) => {
                    tracing::warn!(collection, id = %id, error = %err, "Overwriting malformed remote copy");
                    None
                }
            }
        });

        let mut base = entity.sync_version;
        if let Some(remote) = remote {
            if remote.stamp().produced_by(self.ctx.device_id()) && remote.same_content(&entity) {
                tracing::debug!(collection, id = %id, sync_version = remote.sync_version, "Already published");
                return Ok(PublishOutcome::AlreadyPublished);
            }

            let decision = self.ctx.resolver().resolve(Some(&entity), &remote);
            if decision.resolution == Resolution::ApplyRemote {
                if decision.is_tie() {
                    tracing::info!(collection, id = %id, sync_version = remote.sync_version, "Equal-version conflict, remote device wins");
                }
                let stored = self.ctx.store().set(collection, &id, remote).await?;
                self.notify_changed(collection, &stored);
                tracing::info!(
                    collection,
                    id = %id,
                    local_version = entity.sync_version,
                    remote_version = stored.sync_version,
                    "Local edit superseded by newer remote version"
                );
                return Ok(PublishOutcome::Superseded(stored));
            }
            base = base.max(remote.sync_version);
        }

        let mut published = entity.clone();
        published.stamp_published(base, self.ctx.device_id(), self.ctx.current_user_id());

        if let Err(err) = self
            .ctx
            .remote_call(self.ctx.remote().set_document(
                collection,
                &id,
                published.to_document(),
                true,
            ))
            .await
        {
            return self.enqueue_or_fail(collection, entity, err).await;
        }

        let stored = self.ctx.store().set(collection, &id, published).await?;
        tracing::info!(collection, id = %id, sync_version = stored.sync_version, "Published entity");
        Ok(PublishOutcome::Published(stored))
    }

    async fn enqueue_or_fail(
        &self,
        collection: &str,
        entity: Entity,
        err: SyncError,
    ) -> Result<PublishOutcome> {
        match err.queue_reason() {
            Some(reason) => {
                tracing::warn!(collection, id = %entity.id, error = %err, "Remote call failed, queueing publish");
                self.enqueue(collection, entity, reason).await
            }
            None => Err(err),
        }
    }

    async fn enqueue(
        &self,
        collection: &str,
        entity: Entity,
        reason: QueueReason,
    ) -> Result<PublishOutcome> {
        let id = entity.id.clone();
        let op = PendingOperation::new(collection, entity, now_millis(), reason);
        let outcome = self.ctx.queue().lock().await.enqueue(op);
        let threshold = self.ctx.config().queue_warn_threshold;

        match outcome {
            EnqueueOutcome::Queued { depth } => {
                tracing::debug!(collection, id = %id, ?reason, depth, "Queued publish");
            }
            EnqueueOutcome::Backlogged { depth } => {
                tracing::warn!(collection, id = %id, depth, threshold, "Pending queue backlog");
                self.ctx
                    .observers()
                    .notify(SyncEvent::QueueBacklog { depth });
            }
            EnqueueOutcome::Evicted { depth, evicted } => {
                tracing::warn!(
                    collection = %evicted.entity_collection,
                    id = %evicted.entity_id,
                    depth,
                    "Pending queue full, evicted oldest operation"
                );
                self.ctx.observers().notify(SyncEvent::OperationEvicted {
                    collection: evicted.entity_collection,
                    id: evicted.entity_id,
                });
                if depth > threshold {
                    self.ctx
                        .observers()
                        .notify(SyncEvent::QueueBacklog { depth });
                }
            }
        }

        Ok(PublishOutcome::Queued(reason))
    }

    async fn drain(&self) -> Vec<PublishOutcome> {
        if let Some(reason) = self.ctx.unavailable_reason() {
            tracing::debug!(?reason, "Skipping queue drain");
            return Vec::new();
        }

        let ops = self.ctx.queue().lock().await.take_collapsed();
        if ops.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = ops.len(), "Replaying pending operations");

        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let PendingOperation {
                entity_collection,
                entity_id,
                payload_snapshot,
                ..
            } = op;
            match self.publish(&entity_collection, payload_snapshot).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    tracing::warn!(
                        collection = %entity_collection,
                        id = %entity_id,
                        error = %err,
                        "Dropping pending operation that failed to replay"
                    );
                }
            }
        }

        let remaining = self.ctx.pending_count().await;
        tracing::info!(replayed = outcomes.len(), remaining, "Pending queue drained");
        outcomes
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = watcher {
            task.abort();
        }
        for mut reg in self.registrations.iter_mut() {
            if let Some(task) = reg.task.take() {
                task.abort();
            }
        }
    }
}

/// Consume one subscription until it ends, fails or goes stale.
async fn consume(
    channel: Weak<ChannelInner>,
    key: DocumentKey,
    generation: u64,
    mut subscription: Subscription,
) {
    while let Some(change) = subscription.next().await {
        let Some(inner) = channel.upgrade() else {
            return;
        };
        if !inner.is_current(&key, generation) {
            tracing::debug!(
                collection = %key.collection,
                id = %key.id,
                generation,
                "Dropping delivery for stale listener"
            );
            return;
        }

        match change {
            RemoteChange::Snapshot(Some(value)) => inner.handle_remote(&key, generation, value).await,
            RemoteChange::Snapshot(None) => {
                tracing::debug!(collection = %key.collection, id = %key.id, "Remote document absent");
            }
            RemoteChange::Error(reason) => {
                tracing::warn!(
                    collection = %key.collection,
                    id = %key.id,
                    reason = %reason,
                    "Remote subscription failed"
                );
                inner.fail(&key, generation);
                return;
            }
        }
    }

    if let Some(inner) = channel.upgrade() {
        if inner.is_current(&key, generation) {
            tracing::warn!(collection = %key.collection, id = %key.id, "Remote subscription closed");
            inner.fail(&key, generation);
        }
    }
}

/// React to availability edges until the channel or the context goes away.
async fn watch_availability(
    channel: Weak<ChannelInner>,
    mut auth: watch::Receiver<Option<UserId>>,
    mut online: watch::Receiver<bool>,
    mut enabled: watch::Receiver<bool>,
    mut available: bool,
) {
    loop {
        let alive = tokio::select! {
            changed = auth.changed() => changed.is_ok(),
            changed = online.changed() => changed.is_ok(),
            changed = enabled.changed() => changed.is_ok(),
        };
        if !alive {
            return;
        }
        let Some(inner) = channel.upgrade() else {
            return;
        };

        let now = inner.ctx.is_available();
        if now == available {
            continue;
        }
        available = now;
        inner
            .ctx
            .observers()
            .notify(SyncEvent::AvailabilityChanged { available });

        if available {
            tracing::info!("Sync available, replaying queue and restarting listeners");
            inner.drain().await;
            inner.restart_desired().await;
        } else {
            tracing::info!(reason = ?inner.ctx.unavailable_reason(), "Sync unavailable, stopping listeners");
            inner.stop_live();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionAuth;
    use crate::medium::StorageOrigin;
    use crate::remote::{MemoryRemote, RemoteError, RemoteStore};
    use async_trait::async_trait;
    use codex_sync_engine::Document;
    use serde_json::json;
    use std::time::Duration;

    /// Delegates to a [`MemoryRemote`] but answers reads late, widening the
    /// window between a publish's read and its write.
    struct SlowReads {
        inner: Arc<MemoryRemote>,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteStore for SlowReads {
        async fn set_document(
            &self,
            collection: &str,
            id: &str,
            data: Document,
            merge: bool,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.set_document(collection, id, data, merge).await
        }

        async fn get_document(
            &self,
            collection: &str,
            id: &str,
        ) -> std::result::Result<Option<Value>, RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_document(collection, id).await
        }

        async fn delete_document(&self, collection: &str, id: &str) -> std::result::Result<bool, RemoteError> {
            self.inner.delete_document(collection, id).await
        }

        async fn subscribe(&self, collection: &str, id: &str) -> std::result::Result<Subscription, RemoteError> {
            self.inner.subscribe(collection, id).await
        }

        async fn query_by_field(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> std::result::Result<Vec<Value>, RemoteError> {
            self.inner.query_by_field(collection, field, value).await
        }
    }

    fn setup(remote: &Arc<MemoryRemote>) -> SyncChannel {
        setup_with(remote.clone())
    }

    fn setup_with(remote: Arc<dyn RemoteStore>) -> SyncChannel {
        let (tab, _events) = StorageOrigin::new().open_context();
        let ctx = SyncContext::builder(
            Arc::new(tab),
            remote,
            Arc::new(SessionAuth::signed_in("user-1")),
        )
        .sync_enabled(true)
        .build()
        .unwrap();
        SyncChannel::new(ctx)
    }

    fn campaign(name: &str) -> Entity {
        Entity::from_payload("camp-1", json!({ "name": name })).unwrap()
    }

    #[tokio::test]
    async fn publish_increments_version_and_stamps_device() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);

        let outcome = channel.commit("campaigns", campaign("Camp1")).await.unwrap();
        let PublishOutcome::Published(stored) = outcome else {
            panic!("expected publish, got {outcome:?}");
        };
        assert_eq!(stored.sync_version, 1);
        assert_eq!(stored.device_id.as_deref(), Some(channel.context().device_id()));
        assert_eq!(stored.user_id.as_deref(), Some("user-1"));

        let doc = remote.document("campaigns", "camp-1").unwrap();
        assert_eq!(doc["syncVersion"], 1);
        assert_eq!(doc["name"], "Camp1");
    }

    #[tokio::test]
    async fn publish_builds_on_remote_version() {
        let remote = MemoryRemote::new_shared();
        remote.inject_document(
            "campaigns",
            "camp-1",
            json!({"id": "camp-1", "name": "Old", "syncVersion": 7, "deviceId": "device_0_aaaaaaaaa"}),
        );
        let channel = setup(&remote);

        let local = campaign("Mine").with_version(7, "device_0_zzzzzzzzz");
        let outcome = channel.publish("campaigns", local).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(ref e) if e.sync_version == 8));
    }

    #[tokio::test]
    async fn publish_is_idempotent_for_replayed_snapshot() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        let snapshot = campaign("Camp1");

        channel.publish("campaigns", snapshot.clone()).await.unwrap();
        let again = channel.publish("campaigns", snapshot).await.unwrap();
        assert_eq!(again, PublishOutcome::AlreadyPublished);
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_publishes_of_one_entity_get_distinct_versions() {
        let remote = MemoryRemote::new_shared();
        let channel = setup_with(Arc::new(SlowReads {
            inner: remote.clone(),
            delay: Duration::from_millis(20),
        }));

        let (first, second) = tokio::join!(
            channel.publish("campaigns", campaign("A")),
            channel.publish("campaigns", campaign("B")),
        );
        let version = |outcome: PublishOutcome| match outcome {
            PublishOutcome::Published(entity) => entity.sync_version,
            other => panic!("expected publish, got {other:?}"),
        };
        let (first, second) = (version(first.unwrap()), version(second.unwrap()));

        assert_ne!(first, second);
        assert_eq!(first.max(second), 2);
        assert_eq!(remote.write_count(), 2);
        assert_eq!(remote.document("campaigns", "camp-1").unwrap()["syncVersion"], 2);
        assert!(channel.inner.entity_locks.is_empty());
    }

    #[test]
    fn drain_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        let drain = channel.inner.drain();
        assert_send(&drain);
    }

    #[tokio::test]
    async fn unavailable_publish_is_queued() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        channel.context().set_online(false);

        let outcome = channel.publish("campaigns", campaign("Camp1")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued(QueueReason::Offline));
        assert_eq!(channel.context().pending_count().await, 1);
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn remote_failure_is_queued() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        remote.set_online(false);

        let outcome = channel.publish("campaigns", campaign("Camp1")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued(QueueReason::RemoteUnavailable));

        remote.set_online(true);
        let replayed = channel.drain().await;
        assert_eq!(replayed.len(), 1);
        assert!(matches!(replayed[0], PublishOutcome::Published(_)));
        assert_eq!(channel.context().pending_count().await, 0);
    }

    #[tokio::test]
    async fn listener_states() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        assert_eq!(channel.listener_state("campaigns", "camp-1"), ListenerState::Unsubscribed);

        channel.start_listening("campaigns", "camp-1").await.unwrap();
        assert_eq!(channel.listener_state("campaigns", "camp-1"), ListenerState::Live);
        assert_eq!(remote.active_subscriptions(), 1);

        // Restarting replaces the registration instead of adding one.
        channel.start_listening("campaigns", "camp-1").await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(channel.active_listeners(), 1);

        channel.stop_listening("campaigns", "camp-1");
        assert_eq!(channel.listener_state("campaigns", "camp-1"), ListenerState::Unsubscribed);
    }

    #[tokio::test]
    async fn listening_is_deferred_while_unavailable() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        channel.context().disable_sync().unwrap();

        channel.start_listening("campaigns", "camp-1").await.unwrap();
        assert_eq!(channel.listener_state("campaigns", "camp-1"), ListenerState::Unsubscribed);
        assert_eq!(remote.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn status_reports_state() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        channel.context().set_online(false);
        channel.publish("campaigns", campaign("Camp1")).await.unwrap();

        let status = channel.status().await;
        assert!(status.enabled);
        assert!(status.authenticated);
        assert_eq!(status.user_id.as_deref(), Some("user-1"));
        assert!(!status.online);
        assert_eq!(status.pending_syncs, 1);
        assert_eq!(status.active_listeners, 0);
    }

    #[tokio::test]
    async fn fetch_remote_rejects_malformed() {
        let remote = MemoryRemote::new_shared();
        let channel = setup(&remote);
        remote.inject_document("campaigns", "camp-1", json!("corrupt"));

        let result = channel.fetch_remote("campaigns", "camp-1").await;
        assert!(matches!(result, Err(SyncError::MalformedRemoteData { .. })));
        assert!(channel.fetch_remote("campaigns", "camp-2").await.unwrap().is_none());
    }
}
