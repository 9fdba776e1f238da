//! Synchronous key/value storage medium shared by same-origin contexts.
//!
//! Models the browser's origin-scoped local storage: several execution
//! contexts (tabs) open handles onto one [`StorageOrigin`]. Every mutation made
//! through one context is announced to all *other* contexts as a
//! [`StorageEvent`]; the writer never hears about its own writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// A storage mutation observed from another context.
///
/// `key == None` means the whole store was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Receiver of storage events for one context.
pub type StorageEvents = mpsc::UnboundedReceiver<StorageEvent>;

/// Errors raised by a storage medium.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediumError {
    #[error("quota of {quota} bytes exceeded writing {key} ({needed} bytes needed)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal synchronous storage interface.
pub trait StorageMedium: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write a value. A rejected write leaves the medium unchanged.
    fn set_item(&self, key: &str, value: &str) -> Result<(), MediumError>;

    fn remove_item(&self, key: &str);

    fn clear(&self);

    /// All keys, in sorted order.
    fn keys(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct OriginInner {
    items: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
    contexts: DashMap<String, mpsc::UnboundedSender<StorageEvent>>,
}

impl OriginInner {
    fn items(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to every context except the writer.
    fn broadcast_except(&self, sender_id: &str, event: StorageEvent) -> usize {
        let mut sent_count = 0;

        for entry in self.contexts.iter() {
            if entry.key() != sender_id && entry.value().send(event.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::trace!(
            sender = %sender_id,
            key = ?event.key,
            recipients = sent_count,
            "Broadcast storage event"
        );

        sent_count
    }
}

/// One storage area shared by every context of an origin.
#[derive(Debug, Clone, Default)]
pub struct StorageOrigin {
    inner: Arc<OriginInner>,
}

impl StorageOrigin {
    /// Create an unbounded storage area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage area limited to `bytes` of keys plus values.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: Arc::new(OriginInner {
                quota: Some(bytes),
                ..OriginInner::default()
            }),
        }
    }

    /// Open a new context onto this origin.
    ///
    /// The returned receiver yields mutations made by other contexts.
    pub fn open_context(&self) -> (StorageContext, StorageEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.contexts.insert(id.clone(), tx);

        tracing::debug!(context_id = %id, "Storage context opened");

        let context = StorageContext {
            id,
            origin: Arc::clone(&self.inner),
        };
        (context, rx)
    }

    /// Number of open contexts.
    pub fn context_count(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Bytes currently used.
    pub fn used_bytes(&self) -> usize {
        self.inner
            .items()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

/// A handle onto a [`StorageOrigin`], as held by one tab.
///
/// Dropping the context stops its event delivery.
#[derive(Debug)]
pub struct StorageContext {
    id: String,
    origin: Arc<OriginInner>,
}

impl StorageContext {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        self.origin.contexts.remove(&self.id);
        tracing::debug!(context_id = %self.id, "Storage context closed");
    }
}

impl StorageMedium for StorageContext {
    fn get_item(&self, key: &str) -> Option<String> {
        self.origin.items().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), MediumError> {
        let mut items = self.origin.items();

        if let Some(quota) = self.origin.quota {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > quota {
                return Err(MediumError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }

        let old_value = items.insert(key.to_string(), value.to_string());

        // Broadcast under the lock so every context sees writes in order.
        self.origin.broadcast_except(
            &self.id,
            StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let mut items = self.origin.items();
        if let Some(old_value) = items.remove(key) {
            self.origin.broadcast_except(
                &self.id,
                StorageEvent {
                    key: Some(key.to_string()),
                    old_value: Some(old_value),
                    new_value: None,
                },
            );
        }
    }

    fn clear(&self) {
        let mut items = self.origin.items();
        items.clear();
        self.origin.broadcast_except(
            &self.id,
            StorageEvent {
                key: None,
                old_value: None,
                new_value: None,
            },
        );
    }

    fn keys(&self) -> Vec<String> {
        self.origin.items().keys().cloned().collect()
    }
}
