use serde_json::json;

use super::user_data::*;
use crate::test_utils::field;
use crate::test_utils::key;
use crate::test_utils::object;
use crate::Error;
use crate::FieldMask;
use crate::ModelError;
use crate::Mutation;
use crate::MutationKind;
use crate::ObjectValue;
use crate::Precondition;
use crate::Result;
use crate::TransformOperation;
use crate::Value;

fn patch_parts(mutation: &Mutation) -> (&ObjectValue, &FieldMask) {
    match &mutation.kind {
        MutationKind::Patch { data, mask } => (data, mask),
        other => panic!("expected a patch, got {:?}", other),
    }
}

fn is_invalid_data(result: Result<Mutation>) -> bool {
    matches!(result, Err(Error::Model(ModelError::InvalidData(_))))
}

#[test]
fn test_overwrite_becomes_set_mutation() {
    let data = DocumentData::from(json!({"name": "eros", "size": 3}));
    let mutation = parse_set_data(key("rooms/eros"), &data, &SetOptions::Overwrite).unwrap();
    assert_eq!(mutation.kind, MutationKind::Set(object(json!({"name": "eros", "size": 3}))));
    assert_eq!(mutation.precondition, Precondition::None);
    assert!(mutation.field_transforms.is_empty());
}

#[test]
fn test_sentinels_become_transforms() {
    let data = DocumentData::new()
        .with("name", json!("eros"))
        .with("updated", FieldValue::server_timestamp())
        .with("visits", FieldValue::increment(1i64))
        .with("tags", FieldValue::array_union(vec![Value::from("new")]));
    let mutation = parse_set_data(key("rooms/eros"), &data, &SetOptions::Overwrite).unwrap();

    assert_eq!(mutation.kind, MutationKind::Set(object(json!({"name": "eros"}))));
    let transformed: Vec<_> = mutation.field_transforms.iter().map(|t| t.field.clone()).collect();
    assert_eq!(transformed, vec![field("tags"), field("updated"), field("visits")]);
    assert!(matches!(
        mutation.field_transforms[1].operation,
        TransformOperation::ServerTimestamp
    ));
}

#[test]
fn test_nested_sentinel_uses_full_path() {
    let mut nested = std::collections::BTreeMap::new();
    nested.insert("at".to_string(), FieldValue::server_timestamp());
    let data = DocumentData::new().with("meta", FieldValue::Map(nested));
    let mutation = parse_set_data(key("rooms/eros"), &data, &SetOptions::Overwrite).unwrap();
    assert_eq!(mutation.field_transforms.len(), 1);
    assert_eq!(mutation.field_transforms[0].field, field("meta.at"));
}

#[test]
fn test_increment_needs_numeric_operand() {
    let data = DocumentData::new().with("visits", FieldValue::increment("one"));
    assert!(is_invalid_data(parse_set_data(
        key("rooms/eros"),
        &data,
        &SetOptions::Overwrite
    )));
}

#[test]
fn test_delete_is_rejected_in_plain_set() {
    let data = DocumentData::new().with("name", FieldValue::delete());
    assert!(is_invalid_data(parse_set_data(
        key("rooms/eros"),
        &data,
        &SetOptions::Overwrite
    )));
}

#[test]
fn test_merge_masks_written_leaves_and_deletes() {
    let data = DocumentData::from(json!({"owner": {"name": "ann"}})).with("old", FieldValue::delete());
    let mutation = parse_set_data(key("rooms/eros"), &data, &SetOptions::Merge).unwrap();

    let (object_value, mask) = patch_parts(&mutation);
    assert_eq!(object_value, &object(json!({"owner": {"name": "ann"}})));
    assert_eq!(mask, &FieldMask::new([field("old"), field("owner.name")]));
    assert_eq!(mutation.precondition, Precondition::None);
}

#[test]
fn test_merge_fields_limit_the_mask() {
    let data = DocumentData::from(json!({"a": 1, "b": 2}));
    let options = SetOptions::MergeFields(vec![field("a")]);
    let mutation = parse_set_data(key("rooms/eros"), &data, &options).unwrap();
    let (_, mask) = patch_parts(&mutation);
    assert_eq!(mask, &FieldMask::new([field("a")]));
}

#[test]
fn test_merge_fields_must_appear_in_data() {
    let data = DocumentData::from(json!({"a": 1}));
    let options = SetOptions::MergeFields(vec![field("missing")]);
    assert!(is_invalid_data(parse_set_data(key("rooms/eros"), &data, &options)));
}

#[test]
fn test_merge_fields_drop_transforms_outside_the_mask() {
    let data = DocumentData::from(json!({"a": 1}))
        .with("at", FieldValue::server_timestamp())
        .with("ignored", FieldValue::server_timestamp());
    let options = SetOptions::MergeFields(vec![field("a"), field("at")]);
    let mutation = parse_set_data(key("rooms/eros"), &data, &options).unwrap();
    assert_eq!(mutation.field_transforms.len(), 1);
    assert_eq!(mutation.field_transforms[0].field, field("at"));
}

#[test]
fn test_update_uses_dotted_paths_and_requires_existence() {
    let data = DocumentData::new()
        .with("owner.name", json!("bob"))
        .with("legacy", FieldValue::delete());
    let mutation = parse_update_data(key("rooms/eros"), &data).unwrap();

    let (object_value, mask) = patch_parts(&mutation);
    assert_eq!(object_value, &object(json!({"owner": {"name": "bob"}})));
    assert_eq!(mask, &FieldMask::new([field("legacy"), field("owner.name")]));
    assert_eq!(mutation.precondition, Precondition::Exists(true));
}

#[test]
fn test_update_rejects_empty_and_overlapping_fields() {
    assert!(is_invalid_data(parse_update_data(key("rooms/eros"), &DocumentData::new())));

    let overlapping = DocumentData::new()
        .with("owner", json!({"name": "ann"}))
        .with("owner.name", json!("bob"));
    assert!(is_invalid_data(parse_update_data(key("rooms/eros"), &overlapping)));
}

#[test]
fn test_update_rejects_nested_delete() {
    let mut nested = std::collections::BTreeMap::new();
    nested.insert("name".to_string(), FieldValue::delete());
    let data = DocumentData::new().with("owner", FieldValue::Map(nested));
    assert!(is_invalid_data(parse_update_data(key("rooms/eros"), &data)));
}

#[test]
fn test_document_data_from_non_object_json_is_empty() {
    assert!(DocumentData::from(json!(3)).is_empty());
    assert!(!DocumentData::from(json!({"a": null})).is_empty());
}
