//! Registry of open tabs.
//!
//! Every context of a storage origin can register itself under one shared
//! metadata entry. Records carry their registration time and are dropped once
//! older than the registry's maximum age, so tabs that vanished without
//! unregistering stop counting after a while.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::SyncContext;
use crate::error::Result;
use crate::now_millis;
use crate::store::LocalStore;

/// Metadata entry holding the registered tabs.
pub const ACTIVE_TABS_META: &str = "active_tabs";

/// Records older than this are considered abandoned.
pub const DEFAULT_TAB_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub id: String,
    pub registered_at: u64,
}

/// Shared list of open tabs, persisted in local storage.
#[derive(Debug, Clone)]
pub struct TabRegistry {
    store: Arc<LocalStore>,
    max_age: Duration,
}

impl TabRegistry {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            max_age: DEFAULT_TAB_MAX_AGE,
        }
    }

    pub fn for_context(ctx: &SyncContext) -> Self {
        Self::new(Arc::clone(ctx.store()))
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Register a new tab. It stays registered until the returned handle is
    /// dropped or explicitly unregistered.
    pub fn register(&self) -> Result<TabRegistration> {
        self.register_at(now_millis())
    }

    pub fn register_at(&self, now: u64) -> Result<TabRegistration> {
        let record = TabRecord {
            id: uuid::Uuid::new_v4().to_string(),
            registered_at: now,
        };

        let mut tabs = self.fresh(self.load(), now);
        tabs.push(record.clone());
        self.save(&tabs)?;
        tracing::debug!(tab = %record.id, active = tabs.len(), "Registered tab");

        Ok(TabRegistration {
            registry: self.clone(),
            id: record.id,
            released: false,
        })
    }

    /// Remove a tab record. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> Result<bool> {
        let mut tabs = self.load();
        let before = tabs.len();
        tabs.retain(|tab| tab.id != id);
        if tabs.len() == before {
            return Ok(false);
        }

        self.save(&tabs)?;
        tracing::debug!(tab = %id, active = tabs.len(), "Unregistered tab");
        Ok(true)
    }

    /// Drop abandoned records. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize> {
        self.cleanup_at(now_millis())
    }

    pub fn cleanup_at(&self, now: u64) -> Result<usize> {
        let tabs = self.load();
        let before = tabs.len();
        let kept = self.fresh(tabs, now);
        let removed = before - kept.len();

        if removed > 0 {
            self.save(&kept)?;
            tracing::info!(removed, active = kept.len(), "Removed abandoned tab records");
        }
        Ok(removed)
    }

    /// Number of registered tabs after dropping abandoned records.
    pub fn active_count(&self) -> Result<usize> {
        self.cleanup()?;
        Ok(self.load().len())
    }

    /// Registered tabs, oldest first.
    pub fn active_tabs(&self) -> Vec<TabRecord> {
        self.load()
    }

    fn fresh(&self, mut tabs: Vec<TabRecord>, now: u64) -> Vec<TabRecord> {
        let max_age = u64::try_from(self.max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(max_age);
        tabs.retain(|tab| tab.registered_at > cutoff);
        tabs
    }

    /// Stored records. A corrupt entry reads as empty.
    fn load(&self) -> Vec<TabRecord> {
        let Some(raw) = self.store.get_meta(ACTIVE_TABS_META) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(tabs) => tabs,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring corrupt tab registry");
                Vec::new()
            }
        }
    }

    fn save(&self, tabs: &[TabRecord]) -> Result<()> {
        let raw = serde_json::to_string(tabs)?;
        self.store.set_meta(ACTIVE_TABS_META, &raw)
    }
}

/// A registered tab. Unregisters itself on drop.
#[derive(Debug)]
pub struct TabRegistration {
    registry: TabRegistry,
    id: String,
    released: bool,
}

impl TabRegistration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unregister(mut self) -> Result<bool> {
        self.released = true;
        self.registry.unregister(&self.id)
    }
}

impl Drop for TabRegistration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.registry.unregister(&self.id) {
            tracing::warn!(tab = %self.id, error = %err, "Failed to unregister tab");
        }
    }
}
