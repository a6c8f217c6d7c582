//! Conversion between entities and stored documents.

use crate::engine::Document;
use fleet_core::{EntityType, FleetResult, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Serialize an entity into a document, dropping derived fields that must
/// never be persisted.
pub fn to_document<T: Serialize>(
    entity_type: EntityType,
    value: &T,
    derived: &[&str],
) -> FleetResult<Document> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut doc)) => {
            for field in derived {
                doc.remove(*field);
            }
            Ok(doc)
        }
        Ok(other) => Err(StorageError::Serialization {
            entity_type,
            reason: format!("expected an object, got {}", type_name(&other)),
        }
        .into()),
        Err(e) => Err(StorageError::Serialization {
            entity_type,
            reason: e.to_string(),
        }
        .into()),
    }
}

/// Deserialize a document read back from the engine.
pub fn from_document<T: DeserializeOwned>(
    entity_type: EntityType,
    doc: Document,
) -> FleetResult<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| {
        StorageError::Serialization {
            entity_type,
            reason: e.to_string(),
        }
        .into()
    })
}

pub fn from_documents<T: DeserializeOwned>(
    entity_type: EntityType,
    docs: Vec<Document>,
) -> FleetResult<Vec<T>> {
    docs.into_iter()
        .map(|d| from_document(entity_type, d))
        .collect()
}

/// Serialize any value into a JSON value for use in filters and updates.
pub fn to_value<T: Serialize>(entity_type: EntityType, value: &T) -> FleetResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        StorageError::Serialization {
            entity_type,
            reason: e.to_string(),
        }
        .into()
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
