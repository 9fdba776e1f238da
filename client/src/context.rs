//! Per-device sync context.
//!
//! Everything the sync layer needs about "this device" lives in one explicit
//! [`SyncContext`]: identity, configuration, local store, remote store, auth,
//! connectivity, the user's sync preference, the pending queue and the observer
//! feed. Components receive it as an `Arc` instead of reaching for globals.

use std::future::Future;
use std::sync::Arc;

use codex_sync_engine::{
    ConflictResolver, DeviceId, Keyspace, PendingOperation, PendingOpsQueue, QueueReason, Schema,
    UserId,
};
use tokio::sync::{broadcast, watch, Mutex};

use crate::auth::AuthState;
use crate::config::SyncConfig;
use crate::device;
use crate::error::{Result, SyncError};
use crate::latency::Latency;
use crate::medium::StorageMedium;
use crate::observer::{Observers, SyncEvent};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::LocalStore;

/// Metadata entry holding the user's cloud sync preference.
pub const SYNC_ENABLED_META: &str = "sync_enabled";

/// Shared state of one device.
pub struct SyncContext {
    device_id: DeviceId,
    config: SyncConfig,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthState>,
    resolver: ConflictResolver,
    schema: Schema,
    observers: Observers,
    queue: Mutex<PendingOpsQueue>,
    online: watch::Sender<bool>,
    sync_enabled: watch::Sender<bool>,
}

impl SyncContext {
    /// Start building a context over a storage medium, a remote store and an
    /// auth source.
    pub fn builder(
        medium: Arc<dyn StorageMedium>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthState>,
    ) -> SyncContextBuilder {
        SyncContextBuilder {
            medium,
            remote,
            auth,
            config: SyncConfig::default(),
            latency: None,
            schema: Schema::new(),
            online: true,
            sync_enabled: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn auth(&self) -> &Arc<dyn AuthState> {
        &self.auth
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.store.keyspace()
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.observers.subscribe()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.auth.current_user_id()
    }

    /// Record a connectivity change.
    pub fn set_online(&self, online: bool) {
        if self.online.send_replace(online) != online {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn online_changes(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Turn cloud sync on and persist the preference.
    pub fn enable_sync(&self) -> Result<()> {
        self.store.set_meta(SYNC_ENABLED_META, "true")?;
        self.sync_enabled.send_replace(true);
        tracing::info!("Cloud sync enabled");
        Ok(())
    }

    /// Turn cloud sync off and persist the preference.
    pub fn disable_sync(&self) -> Result<()> {
        self.store.set_meta(SYNC_ENABLED_META, "false")?;
        self.sync_enabled.send_replace(false);
        tracing::info!("Cloud sync disabled");
        Ok(())
    }

    pub fn is_sync_enabled(&self) -> bool {
        *self.sync_enabled.borrow()
    }

    pub fn sync_enabled_changes(&self) -> watch::Receiver<bool> {
        self.sync_enabled.subscribe()
    }

    /// Why remote sync cannot run right now, if it cannot.
    pub fn unavailable_reason(&self) -> Option<QueueReason> {
        if !self.is_sync_enabled() {
            Some(QueueReason::SyncDisabled)
        } else if self.current_user_id().is_none() {
            Some(QueueReason::AuthRequired)
        } else if !self.is_online() {
            Some(QueueReason::Offline)
        } else {
            None
        }
    }

    /// Signed in, online and enabled.
    pub fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }

    pub(crate) fn queue(&self) -> &Mutex<PendingOpsQueue> {
        &self.queue
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Copy of the queued operations, oldest first.
    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Run a remote call bounded by the configured timeout.
    pub(crate) async fn remote_call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.config.remote_timeout)),
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("device_id", &self.device_id)
            .field("config", &self.config)
            .field("online", &self.is_online())
            .field("sync_enabled", &self.is_sync_enabled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    medium: Arc<dyn StorageMedium>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthState>,
    config: SyncConfig,
    latency: Option<Latency>,
    schema: Schema,
    online: bool,
    sync_enabled: Option<bool>,
}

impl SyncContextBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the latency derived from the configuration.
    pub fn latency(mut self, latency: Latency) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Shape rules for remote documents.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Initial connectivity. Defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Set and persist the sync preference. Without this the persisted
    /// preference is used, and sync starts disabled on a fresh device.
    pub fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = Some(enabled);
        self
    }

    pub fn build(self) -> Result<Arc<SyncContext>> {
        let keys = Keyspace::new(self.config.key_prefix.clone());
        let latency = self
            .latency
            .unwrap_or_else(|| Latency::from_duration(self.config.local_latency));
        let store = Arc::new(LocalStore::new(self.medium, keys, latency));

        if !store.is_available() {
            return Err(SyncError::StorageUnavailable(
                "local storage rejected a test write".into(),
            ));
        }

        let device_id = device::load_or_create(&store)?;

        let sync_enabled = match self.sync_enabled {
            Some(enabled) => {
                store.set_meta(SYNC_ENABLED_META, if enabled { "true" } else { "false" })?;
                enabled
            }
            None => store.get_meta(SYNC_ENABLED_META).as_deref() == Some("true"),
        };

        let (online, _) = watch::channel(self.online);
        let (sync_enabled_tx, _) = watch::channel(sync_enabled);

        tracing::info!(
            device_id = %device_id,
            sync_enabled,
            online = self.online,
            "Sync context ready"
        );

        Ok(Arc::new(SyncContext {
            resolver: ConflictResolver::new(device_id.clone()),
            device_id,
            queue: Mutex::new(PendingOpsQueue::with_limits(
                self.config.queue_capacity,
                self.config.queue_warn_threshold,
            )),
            observers: Observers::new(self.config.event_buffer),
            config: self.config,
            store,
            remote: self.remote,
            auth: self.auth,
            schema: self.schema,
            online,
            sync_enabled: sync_enabled_tx,
        }))
    }
}
