//! Version stamps for ordering entity versions across devices.
//!
//! Wall-clock time is never trusted for ordering because device clocks may be
//! skewed. The sync version counter is the only ordering signal; the device ID
//! only breaks ties between equal versions.

use crate::{DeviceId, SyncVersion};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The `(syncVersion, deviceId)` pair identifying one published version.
///
/// Ordering rules:
/// 1. Higher sync version wins
/// 2. If versions are equal, the lexicographically higher device ID wins
/// 3. A missing device ID (never published) sorts below any present one
///
/// This gives a total order across versions produced by all devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStamp {
    /// Monotonic per-entity counter
    pub sync_version: SyncVersion,
    /// Device that produced this version
    pub device_id: Option<DeviceId>,
}

impl VersionStamp {
    /// The stamp of an entity that has never been published.
    pub fn initial() -> Self {
        Self {
            sync_version: 0,
            device_id: None,
        }
    }

    /// Create a stamp for a version produced by a device.
    pub fn new(sync_version: SyncVersion, device_id: impl Into<DeviceId>) -> Self {
        Self {
            sync_version,
            device_id: Some(device_id.into()),
        }
    }

    /// The stamp the given device produces when it publishes on top of this one.
    pub fn next(&self, device_id: impl Into<DeviceId>) -> Self {
        Self::new(self.sync_version.saturating_add(1), device_id)
    }

    /// Whether this stamp was produced by the given device.
    pub fn produced_by(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id)
    }

    /// Check if two stamps collide: same version from different devices.
    pub fn is_concurrent_with(&self, other: &VersionStamp) -> bool {
        self.sync_version == other.sync_version && self.device_id != other.device_id
    }

    fn device_key(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }
}

impl Default for VersionStamp {
    fn default() -> Self {
        Self::initial()
    }
}

impl Ord for VersionStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.sync_version.cmp(&other.sync_version) {
            Ordering::Equal => match (&self.device_id, &other.device_id) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                _ => self.device_key().cmp(other.device_key()),
            },
            other => other,
        }
    }
}

impl PartialOrd for VersionStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
