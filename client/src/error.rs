//! Unified error handling for the sync runtime.

use std::time::Duration;

use codex_sync_engine::QueueReason;

use crate::config::ConfigError;
use crate::remote::RemoteError;

/// Sync runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Storage quota exceeded while writing {key}")]
    StorageQuotaExceeded { key: String },

    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Cloud sync is disabled")]
    SyncDisabled,

    #[error("Device is offline")]
    Offline,

    #[error("Malformed remote data for {collection}/{id}: {reason}")]
    MalformedRemoteData {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("{collection}/{id} was modified at {stored_at}, after the copy being saved ({base_at})")]
    SaveConflict {
        collection: String,
        id: String,
        stored_at: u64,
        base_at: u64,
    },

    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Engine error: {0}")]
    Engine(#[from] codex_sync_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// The queue reason for errors that mean "try again later".
    pub fn queue_reason(&self) -> Option<QueueReason> {
        match self {
            SyncError::RemoteUnavailable(_) => Some(QueueReason::RemoteUnavailable),
            SyncError::Timeout(_) => Some(QueueReason::Timeout),
            SyncError::AuthRequired => Some(QueueReason::AuthRequired),
            SyncError::SyncDisabled => Some(QueueReason::SyncDisabled),
            SyncError::Offline => Some(QueueReason::Offline),
            _ => None,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            RemoteError::PermissionDenied(_) => SyncError::AuthRequired,
            other => SyncError::Remote(other.to_string()),
        }
    }
}

impl From<QueueReason> for SyncError {
    fn from(reason: QueueReason) -> Self {
        match reason {
            QueueReason::Offline => SyncError::Offline,
            QueueReason::AuthRequired => SyncError::AuthRequired,
            QueueReason::SyncDisabled => SyncError::SyncDisabled,
            QueueReason::RemoteUnavailable => SyncError::RemoteUnavailable("unavailable".into()),
            QueueReason::Timeout => SyncError::Timeout(Duration::ZERO),
        }
    }
}

/// Result type alias for the sync runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
