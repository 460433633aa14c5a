use std::cmp::Ordering;

use serde_json::json;

use super::*;
use crate::test_utils::field;
use crate::test_utils::key;
use crate::test_utils::object;
use crate::test_utils::path;

#[test]
fn test_resource_path_parsing_and_relations() {
    let users = path("users");
    let ann = path("/users/ann/");

    assert_eq!(ann.segments(), &["users".to_string(), "ann".to_string()]);
    assert!(users.is_immediate_parent_of(&ann));
    assert!(users.is_prefix_of(&ann.child("posts")));
    assert!(!users.is_immediate_parent_of(&ann.child("posts")));
    assert_eq!(ann.parent(), Some(users));
    assert!(ResourcePath::from_string("users//ann").is_err());
}

#[test]
fn test_resource_path_orders_segment_by_segment() {
    assert!(path("a/b") < path("a/b/c"));
    assert!(path("a/b/c") < path("a/c"));
    assert!(path("a/b") < path("ab"));
}

#[test]
fn test_document_key_requires_even_segments() {
    assert!(DocumentKey::from_string("users").is_err());
    assert!(DocumentKey::from_string("users/42/posts").is_err());

    let k = key("users/42/posts/7");
    assert_eq!(k.collection_group(), "posts");
    assert_eq!(k.document_id(), "7");
    assert_eq!(k.collection_path(), path("users/42/posts"));
}

#[test]
fn test_field_path_parsing() {
    let f = field("address.city");
    assert_eq!(f.len(), 2);
    assert_eq!(f.canonical_string(), "address.city");
    assert!(field("address").is_prefix_of(&f));
    assert!(FieldPath::from_dot_separated("a..b").is_err());
    assert!(FieldPath::key_path().is_key_field_path());
}

#[test]
fn test_value_cross_type_order() {
    let ordered = vec![
        Value::Null,
        Value::Boolean(false),
        Value::Boolean(true),
        Value::Double(f64::NAN),
        Value::Integer(-1),
        Value::Double(0.5),
        Value::Integer(1),
        Value::Timestamp(Timestamp::new(1, 0)),
        Value::ServerTimestamp {
            local_write_time: Timestamp::new(0, 0),
            previous: None,
        },
        Value::String("a".into()),
        Value::Bytes(vec![0]),
        Value::Reference(key("a/b")),
        Value::Array(vec![]),
        Value::Map(Default::default()),
    ];
    for window in ordered.windows(2) {
        assert_eq!(
            window[0].cmp(&window[1]),
            Ordering::Less,
            "{:?} < {:?}",
            window[0],
            window[1]
        );
    }
}

#[test]
fn test_numbers_compare_across_representations() {
    assert_eq!(Value::Integer(1), Value::Double(1.0));
    assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
    assert!(Value::Integer(2) > Value::Double(1.5));
}

#[test]
fn test_object_value_set_and_delete_nested() {
    let mut data = object(json!({"a": 1, "b": {"c": true}}));

    data.set(&field("b.d"), Value::from("x"));
    data.set(&field("a.nested"), Value::Integer(5));
    data.delete(&field("b.c"));

    assert_eq!(
        data,
        object(json!({"a": {"nested": 5}, "b": {"d": "x"}}))
    );
    assert_eq!(data.field(&field("a.nested")), Some(&Value::Integer(5)));
    assert_eq!(data.field(&field("b.c")), None);
}

#[test]
fn test_field_mask_lists_leaves() {
    let data = object(json!({"a": 1, "b": {"c": 2, "d": {}}}));
    let mask = data.field_mask();

    let fields: Vec<String> = mask.fields().iter().map(|f| f.canonical_string()).collect();
    assert_eq!(fields, vec!["a", "b.c", "b.d"]);
    assert!(mask.covers(&field("b.c.x")));
    assert!(!mask.covers(&field("b")));
}

#[test]
fn test_json_round_trip_for_plain_values() {
    let input = json!({"name": "Ann", "age": 30, "tags": ["x"], "ratio": 0.5});
    assert_eq!(object(input.clone()).to_json(), input);
}

#[test]
fn test_document_conversions() {
    let mut d = Document::new_invalid(key("users/1"));
    assert!(!d.is_valid_document());

    d.convert_to_found_document(SnapshotVersion::MIN, object(json!({"x": 1})))
        .set_has_local_mutations();
    assert!(d.is_found_document());
    assert!(d.has_pending_writes());

    d.convert_to_no_document(SnapshotVersion::MIN);
    assert!(d.is_no_document());
    assert!(d.data().is_empty());
    assert!(!d.has_pending_writes());
}

#[test]
fn test_timestamp_normalizes_nanos() {
    let ts = Timestamp::new(1, -1);
    assert_eq!(ts.seconds(), 0);
    assert_eq!(ts.nanos(), 999_999_999);
    assert_eq!(Timestamp::from_millis(1500), Timestamp::new(1, 500_000_000));
}
