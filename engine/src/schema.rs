//! Shape validation for documents received from the remote store.
//!
//! Remote data is never applied over good local state without passing these
//! checks. Every document must be an object whose sync fields have the right
//! types and whose `id` matches the entity it was delivered for. Collections
//! with a registered [`CollectionSchema`] are additionally checked field by
//! field.

use crate::{error::Result, CollectionName, Document, Entity, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Array,
    Object,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Array => write!(f, "Array"),
            FieldType::Object => write!(f, "Object"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Field checks for one collection's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &Document) -> Result<()> {
        for field in &self.fields {
            field.validate(payload.get(&field.name))?;
        }
        Ok(())
    }
}

/// Shape rules applied to every remote document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

/// Sync fields every document must type-check, whatever its collection.
fn sync_fields() -> [FieldDef; 6] {
    [
        FieldDef::optional("id", FieldType::String),
        FieldDef::optional("syncVersion", FieldType::Int),
        FieldDef::optional("deviceId", FieldType::String),
        FieldDef::optional("userId", FieldType::String),
        FieldDef::optional("createdAt", FieldType::Timestamp),
        FieldDef::optional("updatedAtLocal", FieldType::Timestamp),
    ]
}

impl Schema {
    /// Create a schema with no collection-specific rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Validate a remote document delivered for `(collection, expected_id)` and
    /// parse it into an entity.
    pub fn validate_remote(&self, collection: &str, expected_id: &str, value: &Value) -> Result<Entity> {
        let document = value.as_object().ok_or_else(|| {
            Error::InvalidPayload(format!(
                "remote document must be an object, got {}",
                json_type_name(value)
            ))
        })?;

        for field in sync_fields() {
            field.validate(document.get(&field.name))?;
        }
        if let Some(Value::Number(n)) = document.get("syncVersion") {
            if n.as_u64().is_none() {
                return Err(Error::TypeMismatch {
                    field: "syncVersion".into(),
                    expected: "non-negative Int".into(),
                    got: n.to_string(),
                });
            }
        }

        // Documents fetched from the store may omit their own id.
        let mut document = document.clone();
        match document.get("id").and_then(Value::as_str) {
            Some(id) if id != expected_id => {
                return Err(Error::IdMismatch {
                    expected: expected_id.to_string(),
                    actual: id.to_string(),
                });
            }
            Some(_) => {}
            None => {
                document.insert("id".into(), Value::String(expected_id.to_string()));
            }
        }

        let entity = Entity::from_document(document)?;
        if let Some(schema) = self.collections.get(collection) {
            schema.validate_payload(&entity.payload)?;
        }
        Ok(entity)
    }
}
