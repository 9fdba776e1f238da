//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use codex_sync::{
    MemoryRemote, SessionAuth, StorageEvents, StorageOrigin, SyncChannel, SyncConfig, SyncContext,
    SyncEvent,
};
use codex_sync_engine::Entity;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const USER: &str = "user-1";
const WAIT: Duration = Duration::from_secs(2);

/// Install a test-writer subscriber once. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codex_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// One simulated device: its own storage origin, session and channel.
pub struct Device {
    pub origin: StorageOrigin,
    pub auth: Arc<SessionAuth>,
    pub ctx: Arc<SyncContext>,
    pub channel: SyncChannel,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Device {
    /// Signed-in, online, sync-enabled device with the availability watcher running.
    pub fn spawn(remote: &Arc<MemoryRemote>) -> Self {
        Self::build(remote, SyncConfig::default(), true)
    }

    /// Same as [`Device::spawn`] but without the watcher, so tests drain by hand.
    pub fn manual(remote: &Arc<MemoryRemote>) -> Self {
        Self::build(remote, SyncConfig::default(), false)
    }

    pub fn with_config(remote: &Arc<MemoryRemote>, config: SyncConfig) -> Self {
        Self::build(remote, config, false)
    }

    fn build(remote: &Arc<MemoryRemote>, config: SyncConfig, watch: bool) -> Self {
        init_tracing();
        let origin = StorageOrigin::new();
        let auth = Arc::new(SessionAuth::signed_in(USER));
        let (ctx, _storage_events) = open_tab(&origin, remote, &auth, config);
        let events = ctx.subscribe();
        let channel = if watch {
            SyncChannel::spawn(Arc::clone(&ctx))
        } else {
            SyncChannel::new(Arc::clone(&ctx))
        };

        Self {
            origin,
            auth,
            ctx,
            channel,
            events,
        }
    }
}

/// Open one more tab onto an origin.
pub fn open_tab(
    origin: &StorageOrigin,
    remote: &Arc<MemoryRemote>,
    auth: &Arc<SessionAuth>,
    config: SyncConfig,
) -> (Arc<SyncContext>, StorageEvents) {
    let (tab, events) = origin.open_context();
    let ctx = SyncContext::builder(Arc::new(tab), remote.clone(), auth.clone())
        .config(config)
        .sync_enabled(true)
        .build()
        .expect("context builds");
    (ctx, events)
}

pub fn campaign(id: &str, name: &str) -> Entity {
    Entity::from_payload(id, json!({ "name": name, "players": 4 })).expect("valid payload")
}

/// Raw remote document as another device would have published it.
pub fn remote_doc(id: &str, name: &str, version: u64, device: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "syncVersion": version,
        "deviceId": device,
        "userId": USER,
    })
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("observer channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Events already delivered, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `cond` until it holds.
pub async fn eventually<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give spawned tasks a moment to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
