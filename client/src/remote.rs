//! Remote document store contract and an in-process implementation.
//!
//! The remote store holds one JSON document per `(collection, id)` and pushes
//! every change of a document to its live subscriptions. Documents coming back
//! from the store are untrusted `serde_json::Value`s; callers validate them
//! before use.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use codex_sync_engine::Document;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// Errors reported by a remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// One delivery on a document subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// Current state of the document; `None` when it does not exist
    Snapshot(Option<Value>),
    /// The subscription broke; no further changes follow
    Error(String),
}

/// A live subscription to one remote document.
///
/// Dropping it releases the subscription on the remote side.
pub struct Subscription {
    id: String,
    changes: mpsc::UnboundedReceiver<RemoteChange>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription over a change channel; `release` runs on drop.
    pub fn new(
        id: impl Into<String>,
        changes: mpsc::UnboundedReceiver<RemoteChange>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            changes,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next change. `None` once the remote side has closed.
    pub async fn next(&mut self) -> Option<RemoteChange> {
        self.changes.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Operations the sync layer needs from a remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Write a document. With `merge`, top-level fields are merged into the
    /// existing document instead of replacing it.
    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        data: Document,
        merge: bool,
    ) -> Result<(), RemoteError>;

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError>;

    /// Delete a document. Returns whether it existed.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool, RemoteError>;

    /// Subscribe to a document. The current state is delivered first.
    async fn subscribe(&self, collection: &str, id: &str) -> Result<Subscription, RemoteError>;

    /// All documents of a collection whose top-level `field` equals `value`.
    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, RemoteError>;
}

type DocKey = (String, String);

#[derive(Debug)]
struct Subscriber {
    key: DocKey,
    sender: mpsc::UnboundedSender<RemoteChange>,
}

#[derive(Debug, Default)]
struct RemoteInner {
    docs: DashMap<DocKey, Value>,
    subscribers: DashMap<String, Subscriber>,
    offline: AtomicBool,
    stalled: AtomicBool,
    writes: AtomicUsize,
}

impl RemoteInner {
    fn notify(&self, key: &DocKey, change: RemoteChange) -> usize {
        let mut sent_count = 0;

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if &subscriber.key == key && subscriber.sender.send(change.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::trace!(
            collection = %key.0,
            id = %key.1,
            recipients = sent_count,
            "Pushed remote change to subscribers"
        );

        sent_count
    }
}

/// In-process remote store.
///
/// Every write is pushed to all subscriptions of the document, including those
/// held by the writing device. Faults can be injected to exercise offline,
/// slow and broken-connection paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<RemoteInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every call fail with [`RemoteError::Unavailable`] (or succeed again).
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
        tracing::info!(online, "Remote store connectivity changed");
    }

    /// Make every call hang until released.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fail every live subscription with a transport error.
    pub fn break_subscriptions(&self, reason: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut broken = 0;
        for id in ids {
            if let Some((_, subscriber)) = self.inner.subscribers.remove(&id) {
                let _ = subscriber.sender.send(RemoteChange::Error(reason.to_string()));
                broken += 1;
            }
        }

        tracing::warn!(broken, reason, "Broke remote subscriptions");
        broken
    }

    /// Write a raw document as another device would, bypassing validation.
    pub fn inject_document(&self, collection: &str, id: &str, value: Value) {
        let key = (collection.to_string(), id.to_string());
        let entry = self.inner.docs.entry(key.clone()).insert(value.clone());
        self.inner.notify(&key, RemoteChange::Snapshot(Some(value)));
        drop(entry);
    }

    /// Current raw document, without fault injection.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.inner
            .docs
            .get(&(collection.to_string(), id.to_string()))
            .map(|doc| doc.value().clone())
    }

    /// Number of successful `set_document` calls.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscribers.len()
    }

    async fn check_faults(&self) -> Result<(), RemoteError> {
        if self.inner.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("client is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        data: Document,
        merge: bool,
    ) -> Result<(), RemoteError> {
        self.check_faults().await?;

        let key = (collection.to_string(), id.to_string());
        let mut entry = self.inner.docs.entry(key.clone()).or_insert_with(|| Value::Object(Document::new()));

        match entry.value_mut() {
            Value::Object(existing) if merge => existing.extend(data),
            other => *other = Value::Object(data),
        }
        let value = entry.value().clone();

        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        // Notify while holding the entry so deliveries follow write order.
        self.inner.notify(&key, RemoteChange::Snapshot(Some(value)));
        drop(entry);

        tracing::debug!(collection, id, merge, "Remote document written");
        Ok(())
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        self.check_faults().await?;
        Ok(self.document(collection, id))
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool, RemoteError> {
        self.check_faults().await?;

        let key = (collection.to_string(), id.to_string());
        let existed = self.inner.docs.remove(&key).is_some();
        if existed {
            self.inner.notify(&key, RemoteChange::Snapshot(None));
        }
        Ok(existed)
    }

    async fn subscribe(&self, collection: &str, id: &str) -> Result<Subscription, RemoteError> {
        self.check_faults().await?;

        let key = (collection.to_string(), id.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = uuid::Uuid::new_v4().to_string();

        // Register and send the initial snapshot under the document lock so no
        // write can slip in between.
        let current = self.inner.docs.get(&key);
        let snapshot = current.as_ref().map(|doc| doc.value().clone());
        let _ = tx.send(RemoteChange::Snapshot(snapshot));
        self.inner.subscribers.insert(
            sub_id.clone(),
            Subscriber {
                key: key.clone(),
                sender: tx,
            },
        );
        drop(current);

        tracing::debug!(collection, id, sub_id = %sub_id, "Remote subscription registered");

        let inner = Arc::clone(&self.inner);
        let release_id = sub_id.clone();
        Ok(Subscription::new(sub_id, rx, move || {
            if inner.subscribers.remove(&release_id).is_some() {
                tracing::debug!(sub_id = %release_id, "Remote subscription released");
            }
        }))
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.check_faults().await?;

        let mut matches: Vec<(String, Value)> = self
            .inner
            .docs
            .iter()
            .filter(|entry| entry.key().0 == collection && entry.value().get(field) == Some(value))
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(matches.into_iter().map(|(_, doc)| doc).collect())
    }
}
