//! Backup format for exporting and restoring the local key/value store.
//!
//! A backup is a JSON object holding every persisted key of the application
//! together with the time it was taken. Values that are themselves JSON are
//! embedded as JSON, anything else is kept as a plain string.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the backup format written by this crate.
pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// A point-in-time export of persisted keys.
///
/// Uses BTreeMap so exports of the same state are byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Backup format version
    pub version: String,
    /// When the backup was taken (RFC 3339)
    pub timestamp: String,
    /// Persisted values by storage key
    pub store: BTreeMap<String, Value>,
}

impl Backup {
    /// Create an empty backup stamped with `timestamp`.
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self {
            version: BACKUP_FORMAT_VERSION.to_string(),
            timestamp: timestamp.into(),
            store: BTreeMap::new(),
        }
    }

    /// Add a raw stored value.
    pub fn insert_raw(&mut self, key: impl Into<String>, raw: &str) {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        self.store.insert(key.into(), value);
    }

    /// Iterate over `(key, raw value)` pairs ready to be written back to storage.
    pub fn raw_entries(&self) -> impl Iterator<Item = (&str, String)> {
        self.store.iter().map(|(key, value)| {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.as_str(), raw)
        })
    }

    /// Number of keys in the backup.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the backup holds no keys.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidBackup(e.to_string()))
    }

    /// Parse a backup.
    ///
    /// Only `store` is mandatory; older exports without a version or timestamp
    /// are still accepted.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::InvalidBackup(e.to_string()))?;

        let Some(Value::Object(store)) = value.get("store") else {
            return Err(Error::InvalidBackup("missing store object".into()));
        };

        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            version: text("version"),
            timestamp: text("timestamp"),
            store: store.clone().into_iter().collect(),
        })
    }
}
