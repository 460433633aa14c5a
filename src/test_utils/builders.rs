use std::collections::BTreeMap;

use crate::Document;
use crate::DocumentKey;
use crate::FieldMask;
use crate::FieldPath;
use crate::Mutation;
use crate::ObjectValue;
use crate::Precondition;
use crate::ResourcePath;
use crate::SnapshotVersion;
use crate::Timestamp;
use crate::Value;

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document key")
}

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).expect("valid path")
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).expect("valid field path")
}

pub fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_timestamp(Timestamp::new(
        micros / 1_000_000,
        ((micros % 1_000_000) * 1000) as i32,
    ))
}

/// Builds an [`ObjectValue`] from a JSON object literal.
pub fn object(json: serde_json::Value) -> ObjectValue {
    match Value::from(json) {
        Value::Map(fields) => ObjectValue::from_map(fields),
        other => {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_string(), other);
            ObjectValue::from_map(fields)
        }
    }
}

pub fn doc(
    path: &str,
    micros: i64,
    json: serde_json::Value,
) -> Document {
    Document::new_found(key(path), version(micros), object(json))
}

pub fn deleted_doc(
    path: &str,
    micros: i64,
) -> Document {
    Document::new_no_document(key(path), version(micros))
}

pub fn unknown_doc(
    path: &str,
    micros: i64,
) -> Document {
    Document::new_unknown(key(path), version(micros))
}

pub fn set_mutation(
    path: &str,
    json: serde_json::Value,
) -> Mutation {
    Mutation::set(key(path), object(json))
}

/// Patch writing every leaf of `json`, requiring the document to exist.
pub fn patch_mutation(
    path: &str,
    json: serde_json::Value,
) -> Mutation {
    let data = object(json);
    let mask = data.field_mask();
    Mutation::patch(key(path), data, mask, Precondition::Exists(true))
}

/// Patch writing exactly `fields`; fields missing from `json` are deleted.
pub fn merge_mutation(
    path: &str,
    json: serde_json::Value,
    fields: &[&str],
) -> Mutation {
    let mask = FieldMask::new(fields.iter().map(|f| field(f)));
    Mutation::patch(key(path), object(json), mask, Precondition::None)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}
