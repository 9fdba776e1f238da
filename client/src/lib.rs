//! # Codex Sync
//!
//! Local-first state synchronization for DM Codex.
//!
//! Entities are written to local storage first and mirrored to a remote
//! document store when the user is signed in, online and has cloud sync
//! enabled. Each device keeps live subscriptions to the entities it cares
//! about and settles conflicts with last-write-wins over per-entity version
//! counters (see [`codex_sync_engine::ConflictResolver`]).
//!
//! ## Components
//!
//! - [`LocalStore`]: the [`KeyValueStore`] over a [`StorageMedium`]
//! - [`MemoryRemote`]: an in-process [`RemoteStore`]
//! - [`SyncContext`]: everything one device owns
//! - [`SyncChannel`]: publishes, remote subscriptions and queue replay
//! - [`CrossTabBridge`]: propagation between contexts sharing one storage origin
//! - [`TabRegistry`]: which tabs of an origin are open
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use codex_sync::{MemoryRemote, SessionAuth, StorageOrigin, SyncChannel, SyncContext};
//! use codex_sync_engine::Entity;
//! use serde_json::json;
//!
//! # async fn run() -> codex_sync::Result<()> {
//! let origin = StorageOrigin::new();
//! let (tab, _events) = origin.open_context();
//! let ctx = SyncContext::builder(
//!     Arc::new(tab),
//!     MemoryRemote::new_shared(),
//!     Arc::new(SessionAuth::signed_in("user-1")),
//! )
//! .sync_enabled(true)
//! .build()?;
//!
//! let channel = SyncChannel::spawn(ctx);
//! channel.start_listening("campaigns", "camp-1").await?;
//!
//! let campaign = Entity::from_payload("camp-1", json!({"name": "Camp1"}))?;
//! channel.commit("campaigns", campaign).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod latency;
pub mod medium;
pub mod observer;
pub mod remote;
pub mod store;
pub mod tabs;

pub use auth::{AuthState, SessionAuth};
pub use bridge::CrossTabBridge;
pub use channel::{ListenerState, PublishOutcome, SyncChannel, SyncStatus};
pub use config::{ConfigError, SyncConfig};
pub use context::{SyncContext, SyncContextBuilder};
pub use error::{Result, SyncError};
pub use latency::Latency;
pub use medium::{MediumError, StorageContext, StorageEvent, StorageEvents, StorageMedium, StorageOrigin};
pub use observer::{ChangeOrigin, Observers, SyncEvent};
pub use remote::{MemoryRemote, RemoteChange, RemoteError, RemoteStore, Subscription};
pub use store::{KeyValueStore, LocalStore};
pub use tabs::{TabRecord, TabRegistration, TabRegistry, ACTIVE_TABS_META, DEFAULT_TAB_MAX_AGE};

/// Wall-clock milliseconds since the epoch.
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
