//! Entity types for synchronized documents.
//!
//! An entity is stored as one flat JSON object: the sync fields sit next to the
//! application payload at the top level, exactly as the remote document store
//! and the local persistence layer see it.

use crate::{
    error::Result, DeviceId, Document, EntityId, Error, SyncVersion, Timestamp, UserId,
    VersionStamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level field names owned by the sync layer.
pub const RESERVED_FIELDS: [&str; 6] = [
    "id",
    "syncVersion",
    "deviceId",
    "userId",
    "createdAt",
    "updatedAtLocal",
];

/// A named, identified, versioned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable identifier, unique within its collection
    pub id: EntityId,
    /// Monotonic per-entity counter, incremented on every publish
    #[serde(default)]
    pub sync_version: SyncVersion,
    /// Device that produced the current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// User that published the current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// When the entity was first stored locally (milliseconds since epoch)
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last local mutation (milliseconds since epoch). Display only.
    #[serde(default)]
    pub updated_at_local: Timestamp,
    /// Application-owned data, opaque to the sync layer
    #[serde(flatten)]
    pub payload: Document,
}

impl Entity {
    /// Create an unpublished entity with the given payload.
    pub fn new(id: impl Into<EntityId>, payload: Document) -> Self {
        Self {
            id: id.into(),
            sync_version: 0,
            device_id: None,
            user_id: None,
            created_at: 0,
            updated_at_local: 0,
            payload: strip_reserved(payload),
        }
    }

    /// Create an unpublished entity from a JSON payload value.
    ///
    /// The payload must be an object.
    pub fn from_payload(id: impl Into<EntityId>, payload: Value) -> Result<Self> {
        match payload {
            Value::Object(map) => Ok(Self::new(id, map)),
            other => Err(Error::InvalidPayload(format!(
                "payload must be an object, got {}",
                crate::schema::json_type_name(&other)
            ))),
        }
    }

    /// Parse an entity from a stored or remote flat document.
    pub fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(document))
            .map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Render the entity as a flat document.
    pub fn to_document(&self) -> Document {
        let mut document = self.payload.clone();
        document.insert("id".into(), Value::String(self.id.clone()));
        document.insert("syncVersion".into(), Value::from(self.sync_version));
        if let Some(device_id) = &self.device_id {
            document.insert("deviceId".into(), Value::String(device_id.clone()));
        }
        if let Some(user_id) = &self.user_id {
            document.insert("userId".into(), Value::String(user_id.clone()));
        }
        document.insert("createdAt".into(), Value::from(self.created_at));
        document.insert("updatedAtLocal".into(), Value::from(self.updated_at_local));
        document
    }

    /// Builder-style method to set the version stamp.
    pub fn with_version(mut self, sync_version: SyncVersion, device_id: impl Into<DeviceId>) -> Self {
        self.sync_version = sync_version;
        self.device_id = Some(device_id.into());
        self
    }

    /// The version stamp of this entity.
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            sync_version: self.sync_version,
            device_id: self.device_id.clone(),
        }
    }

    /// Stamp the entity as published by a device on top of `base`.
    pub fn stamp_published(
        &mut self,
        base: SyncVersion,
        device_id: impl Into<DeviceId>,
        user_id: Option<UserId>,
    ) {
        self.sync_version = base.saturating_add(1);
        self.device_id = Some(device_id.into());
        self.user_id = user_id;
    }

    /// Stamp a local write: `updatedAtLocal` always, `createdAt` when unset.
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at_local = now;
        if self.created_at == 0 {
            self.created_at = now;
        }
    }

    /// Replace the payload, dropping any reserved keys it carries.
    pub fn set_payload(&mut self, payload: Document) {
        self.payload = strip_reserved(payload);
    }

    /// Whether two entities carry the same application data.
    pub fn same_content(&self, other: &Entity) -> bool {
        self.id == other.id && self.payload == other.payload
    }

    /// Shallow-merge top-level fields into the flat document and re-parse.
    ///
    /// Reserved fields in `partial` are ignored: identity and the version
    /// stamp only change through [`stamp_published`](Self::stamp_published)
    /// and [`touch`](Self::touch).
    pub fn merged_with(&self, partial: &Document) -> Result<Self> {
        let mut document = self.to_document();
        for (key, value) in partial {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            document.insert(key.clone(), value.clone());
        }
        Self::from_document(document)
    }

    /// Check a top-level equality filter against the flat document.
    pub fn matches(&self, filter: &Document) -> bool {
        let document = self.to_document();
        filter
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

fn strip_reserved(mut payload: Document) -> Document {
    for field in RESERVED_FIELDS {
        payload.remove(field);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_entity() {
        let entity = Entity::from_payload("camp-1", json!({"name": "Camp1"})).unwrap();

        assert_eq!(entity.id, "camp-1");
        assert_eq!(entity.sync_version, 0);
        assert!(entity.device_id.is_none());
        assert_eq!(entity.payload, doc(json!({"name": "Camp1"})));
    }

    #[test]
    fn payload_must_be_object() {
        let result = Entity::from_payload("camp-1", json!([1, 2, 3]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn reserved_fields_are_stripped_from_payload() {
        let entity = Entity::from_payload(
            "camp-1",
            json!({"name": "Camp1", "syncVersion": 99, "deviceId": "spoofed"}),
        )
        .unwrap();

        assert_eq!(entity.sync_version, 0);
        assert!(entity.device_id.is_none());
        assert!(!entity.payload.contains_key("syncVersion"));
    }

    #[test]
    fn flat_document_layout() {
        let entity = Entity::from_payload("camp-1", json!({"name": "Camp1"}))
            .unwrap()
            .with_version(3, "device-aaa");

        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["id"], "camp-1");
        assert_eq!(value["name"], "Camp1");
        assert_eq!(value["syncVersion"], 3);
        assert_eq!(value["deviceId"], "device-aaa");
    }

    #[test]
    fn from_document_defaults_missing_sync_fields() {
        let entity = Entity::from_document(doc(json!({"id": "camp-1", "name": "Camp1"}))).unwrap();
        assert_eq!(entity.sync_version, 0);
        assert_eq!(entity.created_at, 0);
        assert_eq!(entity.payload, doc(json!({"name": "Camp1"})));
    }

    #[test]
    fn document_roundtrip_keeps_payload() {
        let mut entity = Entity::from_payload("s-1", json!({"title": "Session 1", "notes": []}))
            .unwrap()
            .with_version(2, "device-aaa");
        entity.touch(1000);

        let parsed = Entity::from_document(entity.to_document()).unwrap();
        assert_eq!(parsed, entity);
    }

    #[test]
    fn touch_sets_created_once() {
        let mut entity = Entity::from_payload("camp-1", json!({})).unwrap();
        entity.touch(1000);
        entity.touch(2000);

        assert_eq!(entity.created_at, 1000);
        assert_eq!(entity.updated_at_local, 2000);
    }

    #[test]
    fn stamp_published_increments_from_base() {
        let mut entity = Entity::from_payload("camp-1", json!({})).unwrap();
        entity.stamp_published(4, "device-aaa", Some("user-1".into()));

        assert_eq!(entity.stamp(), VersionStamp::new(5, "device-aaa"));
        assert_eq!(entity.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn merge_is_shallow() {
        let entity = Entity::from_payload(
            "camp-1",
            json!({"name": "Camp1", "settings": {"theme": "dark", "sound": true}}),
        )
        .unwrap();

        let merged = entity
            .merged_with(&doc(json!({"settings": {"theme": "light"}, "id": "other"})))
            .unwrap();

        assert_eq!(merged.id, "camp-1");
        assert_eq!(merged.payload["name"], "Camp1");
        assert_eq!(merged.payload["settings"], json!({"theme": "light"}));
    }

    #[test]
    fn merge_leaves_version_stamp_alone() {
        let entity = Entity::from_payload("camp-1", json!({"name": "Camp1"}))
            .unwrap()
            .with_version(4, "device-aaa");

        let merged = entity
            .merged_with(&doc(json!({
                "name": "Renamed",
                "syncVersion": 0,
                "deviceId": "device-zzz",
                "userId": "intruder",
                "createdAt": 1,
            })))
            .unwrap();

        assert_eq!(merged.stamp(), VersionStamp::new(4, "device-aaa"));
        assert_eq!(merged.user_id, entity.user_id);
        assert_eq!(merged.created_at, entity.created_at);
        assert_eq!(merged.payload["name"], "Renamed");
        assert!(merged.payload.get("syncVersion").is_none());
    }

    #[test]
    fn equality_filter_over_top_level_fields() {
        let entity = Entity::from_payload("camp-1", json!({"name": "Camp1", "level": 3}))
            .unwrap()
            .with_version(1, "device-aaa");

        assert!(entity.matches(&doc(json!({"name": "Camp1"}))));
        assert!(entity.matches(&doc(json!({"deviceId": "device-aaa", "level": 3}))));
        assert!(!entity.matches(&doc(json!({"level": "3"}))));
        assert!(!entity.matches(&doc(json!({"missing": null}))));
        assert!(entity.matches(&Document::new()));
    }
}
