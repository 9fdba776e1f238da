//! Change notifications for the application layer.
//!
//! Anything that renders entity state subscribes to an [`Observers`] feed
//! instead of being called back directly. A slow subscriber lags and skips
//! events; it never blocks the sync layer.

use codex_sync_engine::{CollectionName, EntityId, SyncVersion};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::ListenerState;

/// Where a local change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    /// Another device, through the remote store
    Remote,
    /// Another context sharing this device's storage
    OtherTab,
}

/// Events emitted by the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    EntityChanged {
        collection: CollectionName,
        id: EntityId,
        origin: ChangeOrigin,
        sync_version: SyncVersion,
    },
    #[serde(rename_all = "camelCase")]
    EntityRemoved {
        collection: CollectionName,
        id: EntityId,
        origin: ChangeOrigin,
    },
    /// Another context cleared the whole store
    StoreCleared,
    #[serde(rename_all = "camelCase")]
    ListenerStateChanged {
        collection: CollectionName,
        id: EntityId,
        state: ListenerState,
    },
    /// The pending queue is deeper than its warning threshold
    QueueBacklog { depth: usize },
    /// A queued publish was dropped to stay within capacity
    OperationEvicted {
        collection: CollectionName,
        id: EntityId,
    },
    /// Sync became available or unavailable
    AvailabilityChanged { available: bool },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct Observers {
    sender: broadcast::Sender<SyncEvent>,
}

impl Observers {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Send an event. Returns the number of subscribers that will see it.
    pub fn notify(&self, event: SyncEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(?event, "No observers for event");
                0
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
