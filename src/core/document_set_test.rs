use serde_json::json;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::doc;
use crate::test_utils::field;
use crate::test_utils::key;
use crate::FieldPath;
use crate::Value;

fn by_sort() -> DocumentComparator {
    DocumentComparator::new(vec![
        OrderBy::new(field("sort"), Direction::Ascending),
        OrderBy::new(FieldPath::key_path(), Direction::Ascending),
    ])
}

fn keys(set: &DocumentSet) -> Vec<String> {
    set.iter().map(|d| d.key().path().canonical_string()).collect()
}

#[test]
fn test_insert_keeps_comparator_order() {
    let mut set = DocumentSet::new(by_sort());
    set.insert(doc("rooms/c", 1, json!({"sort": 3})));
    set.insert(doc("rooms/a", 1, json!({"sort": 1})));
    set.insert(doc("rooms/b", 1, json!({"sort": 2})));

    assert_eq!(keys(&set), vec!["rooms/a", "rooms/b", "rooms/c"]);
    assert_eq!(set.first().unwrap().key(), &key("rooms/a"));
    assert_eq!(set.last().unwrap().key(), &key("rooms/c"));
    assert_eq!(set.index_of(&key("rooms/b")), Some(1));
    assert_eq!(set.index_of(&key("rooms/x")), None);
}

#[test]
fn test_insert_replaces_document_with_same_key() {
    let mut set = DocumentSet::new(by_sort());
    set.insert(doc("rooms/a", 1, json!({"sort": 1})));
    set.insert(doc("rooms/b", 1, json!({"sort": 2})));
    set.insert(doc("rooms/a", 2, json!({"sort": 5})));

    assert_eq!(set.len(), 2);
    assert_eq!(keys(&set), vec!["rooms/b", "rooms/a"]);
    assert_eq!(set.get(&key("rooms/a")).unwrap().field(&field("sort")), Some(&Value::Integer(5)));
}

#[test]
fn test_remove() {
    let mut set = DocumentSet::new(by_sort());
    set.insert(doc("rooms/a", 1, json!({"sort": 1})));
    set.insert(doc("rooms/b", 1, json!({"sort": 1})));

    assert!(set.remove(&key("rooms/a")).is_some());
    assert!(set.remove(&key("rooms/a")).is_none());
    assert!(!set.contains(&key("rooms/a")));
    assert_eq!(keys(&set), vec!["rooms/b"]);
}

#[test]
fn test_empty_like_keeps_comparator() {
    let mut set = DocumentSet::new(by_sort());
    set.insert(doc("rooms/a", 1, json!({"sort": 1})));
    let empty = set.empty_like();
    assert!(empty.is_empty());
    assert_eq!(empty.comparator(), set.comparator());
}

#[test]
fn test_equality_compares_contents_in_order() {
    let mut left = DocumentSet::new(by_sort());
    let mut right = DocumentSet::new(by_sort());
    left.insert(doc("rooms/a", 1, json!({"sort": 1})));
    left.insert(doc("rooms/b", 1, json!({"sort": 2})));
    right.insert(doc("rooms/b", 1, json!({"sort": 2})));
    right.insert(doc("rooms/a", 1, json!({"sort": 1})));
    assert_eq!(left, right);

    right.insert(doc("rooms/a", 2, json!({"sort": 1})));
    assert_ne!(left, right);
}

// -
// DocumentChangeSet

fn change(
    change_type: ChangeType,
    version: i64,
) -> DocumentViewChange {
    DocumentViewChange::new(change_type, doc("rooms/a", version, json!({"v": version})))
}

fn merged(changes: Vec<DocumentViewChange>) -> Vec<DocumentViewChange> {
    let mut set = DocumentChangeSet::default();
    for c in changes {
        set.track(c);
    }
    set.into_changes()
}

#[test]
fn test_added_then_modified_stays_added_with_new_doc() {
    let result = merged(vec![change(ChangeType::Added, 1), change(ChangeType::Modified, 2)]);
    assert_eq!(result, vec![change(ChangeType::Added, 2)]);
}

#[test]
fn test_added_then_removed_cancels_out() {
    let mut set = DocumentChangeSet::default();
    set.track(change(ChangeType::Added, 1));
    set.track(change(ChangeType::Removed, 1));
    assert!(set.is_empty());
}

#[test]
fn test_modified_then_removed_reports_removal_of_old_doc() {
    let result = merged(vec![change(ChangeType::Modified, 1), change(ChangeType::Removed, 2)]);
    assert_eq!(result, vec![change(ChangeType::Removed, 1)]);
}

#[test]
fn test_removed_then_added_becomes_modified() {
    let result = merged(vec![change(ChangeType::Removed, 1), change(ChangeType::Added, 2)]);
    assert_eq!(result, vec![change(ChangeType::Modified, 2)]);
}

#[test]
fn test_metadata_merges_into_existing_change() {
    let result = merged(vec![change(ChangeType::Modified, 1), change(ChangeType::Metadata, 2)]);
    assert_eq!(result, vec![change(ChangeType::Modified, 2)]);

    let result = merged(vec![change(ChangeType::Metadata, 1), change(ChangeType::Modified, 2)]);
    assert_eq!(result, vec![change(ChangeType::Modified, 2)]);

    let result = merged(vec![change(ChangeType::Metadata, 1), change(ChangeType::Removed, 2)]);
    assert_eq!(result, vec![change(ChangeType::Removed, 2)]);
}

#[test]
#[traced_test]
fn test_unsupported_sequence_is_logged_and_overwritten() {
    let result = merged(vec![change(ChangeType::Added, 1), change(ChangeType::Added, 2)]);
    assert_eq!(result, vec![change(ChangeType::Added, 2)]);
    assert!(logs_contain("unsupported change"));
}
