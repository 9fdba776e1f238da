//! Error types for the sync engine.

use crate::{CollectionName, EntityId};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Shape errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("entity id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: EntityId, actual: EntityId },

    // Namespace errors
    #[error("invalid collection name: {0}")]
    InvalidCollection(CollectionName),

    #[error("invalid entity id: {0:?}")]
    InvalidEntityId(EntityId),

    // Backup errors
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
