//! Conflict resolution between a local copy and an incoming remote copy.
//!
//! This is the core of last-write-wins determinism. Given the local entity
//! (if any) and a remote entity, the resolver decides what the local device
//! must do.
//!
//! # Algorithm
//!
//! 1. No local copy: apply the remote copy
//! 2. Remote copy produced by this device: ignore it (echo suppression)
//! 3. Remote version higher: apply the remote copy
//! 4. Remote version lower: keep local, and re-publish it
//! 5. Equal versions from different devices: the larger device ID wins
//!
//! An equal version from the same device is the copy already held locally and
//! resolves to [`Resolution::NoOp`].
//!
//! Rule 5 is a last resort for two devices that both edited before either
//! synced. One of the edits is lost; this is the documented cost of
//! last-write-wins and is not reconciled field by field.

use crate::{DeviceId, Entity};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What the local device must do with a remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Local copy wins; it should be re-published
    KeepLocal,
    /// Remote copy wins; overwrite local state
    ApplyRemote,
    /// Nothing to do
    NoOp,
}

/// Why a resolution was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reason {
    /// There was no local copy
    NoLocalCopy,
    /// The remote copy was produced by this device
    Echo,
    /// The remote version is higher
    RemoteNewer,
    /// The local version is higher
    LocalNewer,
    /// Equal versions, the remote device ID is larger
    TieRemoteWins,
    /// Equal versions, the remote device ID is not larger
    TieLocalWins,
    /// Same version from the same device: already applied
    UpToDate,
}

/// A resolution together with the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub resolution: Resolution,
    pub reason: Reason,
}

impl Decision {
    fn new(resolution: Resolution, reason: Reason) -> Self {
        Self { resolution, reason }
    }

    /// Whether the local copy must be pushed back to the remote store.
    pub fn requires_republish(&self) -> bool {
        self.resolution == Resolution::KeepLocal
    }

    /// Whether this decision came from the equal-version tie-break.
    pub fn is_tie(&self) -> bool {
        matches!(self.reason, Reason::TieRemoteWins | Reason::TieLocalWins)
    }
}

/// Resolves remote copies against local state for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolver {
    local_device_id: DeviceId,
}

impl ConflictResolver {
    /// Create a resolver for the given local device.
    pub fn new(local_device_id: impl Into<DeviceId>) -> Self {
        Self {
            local_device_id: local_device_id.into(),
        }
    }

    /// The device this resolver decides for.
    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    /// Decide what to do with `remote` given the current `local` copy.
    pub fn resolve(&self, local: Option<&Entity>, remote: &Entity) -> Decision {
        let Some(local) = local else {
            return Decision::new(Resolution::ApplyRemote, Reason::NoLocalCopy);
        };

        if remote.device_id.as_deref() == Some(self.local_device_id.as_str()) {
            return Decision::new(Resolution::NoOp, Reason::Echo);
        }

        match remote.sync_version.cmp(&local.sync_version) {
            Ordering::Greater => Decision::new(Resolution::ApplyRemote, Reason::RemoteNewer),
            Ordering::Less => Decision::new(Resolution::KeepLocal, Reason::LocalNewer),
            Ordering::Equal => {
                let remote_device = remote.device_id.as_deref().unwrap_or("");
                let local_device = local.device_id.as_deref().unwrap_or("");
                if remote_device == local_device {
                    Decision::new(Resolution::NoOp, Reason::UpToDate)
                } else if remote_device > local_device {
                    Decision::new(Resolution::ApplyRemote, Reason::TieRemoteWins)
                } else {
                    Decision::new(Resolution::NoOp, Reason::TieLocalWins)
                }
            }
        }
    }
}
