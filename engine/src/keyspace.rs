//! Persistence key namespace.
//!
//! Every entity lives under its own key so that a storage-change notification
//! names exactly one entity:
//!
//! ```text
//! {prefix}doc:{collection}:{id}     one entity document
//! {prefix}meta:{name}               device-local metadata (device id, preferences)
//! ```
//!
//! Collection names may not contain `:`; entity IDs may.

use crate::{error::Result, CollectionName, EntityId, Error};

/// Default application prefix for all keys.
pub const DEFAULT_PREFIX: &str = "dm_codex_";

const DOC_SEGMENT: &str = "doc:";
const META_SEGMENT: &str = "meta:";

/// A parsed entity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub collection: CollectionName,
    pub id: EntityId,
}

impl DocumentKey {
    pub fn new(collection: impl Into<CollectionName>, id: impl Into<EntityId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Maps collections and entity IDs to storage keys and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Create a keyspace under the given application prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The application prefix shared by every key.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key of one entity.
    pub fn document_key(&self, collection: &str, id: &str) -> Result<String> {
        validate_collection(collection)?;
        if id.is_empty() {
            return Err(Error::InvalidEntityId(id.to_string()));
        }
        Ok(format!("{}{DOC_SEGMENT}{collection}:{id}", self.prefix))
    }

    /// Key prefix shared by every entity of a collection.
    pub fn collection_prefix(&self, collection: &str) -> Result<String> {
        validate_collection(collection)?;
        Ok(format!("{}{DOC_SEGMENT}{collection}:", self.prefix))
    }

    /// Storage key of a metadata entry.
    pub fn meta_key(&self, name: &str) -> String {
        format!("{}{META_SEGMENT}{name}", self.prefix)
    }

    /// Parse an entity key. Returns `None` for any other key.
    pub fn parse(&self, key: &str) -> Option<DocumentKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(DOC_SEGMENT)?;
        let (collection, id) = rest.split_once(':')?;
        if collection.is_empty() || id.is_empty() {
            return None;
        }
        Some(DocumentKey::new(collection, id))
    }

    /// Whether a key belongs to this application at all.
    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() || collection.contains(':') {
        return Err(Error::InvalidCollection(collection.to_string()));
    }
    Ok(())
}
