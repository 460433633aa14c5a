use std::collections::BTreeMap;

use serde_json::json;
use tracing_test::traced_test;

use super::*;
use crate::core::Query;
use crate::core::TargetData;
use crate::core::TargetPurpose;
use crate::test_utils::doc;
use crate::test_utils::key;
use crate::test_utils::path;
use crate::test_utils::version;
use crate::DocumentKeySet;
use crate::TargetId;

const ROOMS: TargetId = 2;
const LIMBO: TargetId = 1;

#[derive(Default)]
struct TestMetadata {
    targets: BTreeMap<TargetId, TargetData>,
    remote_keys: BTreeMap<TargetId, DocumentKeySet>,
}

impl TestMetadata {
    fn with_rooms(remote_keys: &[&str]) -> Self {
        let mut metadata = Self::default();
        let target = Query::collection(path("rooms")).unwrap().to_target();
        metadata
            .targets
            .insert(ROOMS, TargetData::new(target, ROOMS, TargetPurpose::Listen, 1));
        metadata
            .remote_keys
            .insert(ROOMS, remote_keys.iter().map(|p| key(p)).collect());
        metadata
    }

    fn with_limbo(
        mut self,
        limbo_path: &str,
    ) -> Self {
        let target = Query::document(&key(limbo_path)).to_target();
        self.targets.insert(
            LIMBO,
            TargetData::new(target, LIMBO, TargetPurpose::LimboResolution, -1),
        );
        self
    }
}

impl TargetMetadataProvider for TestMetadata {
    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet {
        self.remote_keys.get(&target_id).cloned().unwrap_or_default()
    }

    fn get_target_data_for_target(
        &self,
        target_id: TargetId,
    ) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }
}

/// Aggregator with the listen request for `target_ids` acknowledged.
fn acknowledged(
    target_ids: &[TargetId],
    metadata: &TestMetadata,
) -> WatchChangeAggregator {
    let mut aggregator = WatchChangeAggregator::new();
    for target_id in target_ids {
        aggregator.record_pending_target_request(*target_id);
    }
    aggregator.handle_target_change(
        &WatchTargetChange::new(WatchTargetChangeState::Added, target_ids.to_vec()),
        metadata,
    );
    aggregator
}

fn update(
    target_id: TargetId,
    document: Document,
) -> DocumentWatchChange {
    DocumentWatchChange {
        updated_target_ids: vec![target_id],
        removed_target_ids: Vec::new(),
        key: document.key().clone(),
        document: Some(document),
    }
}

fn removal(
    target_id: TargetId,
    path: &str,
) -> DocumentWatchChange {
    DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: vec![target_id],
        key: key(path),
        document: None,
    }
}

fn keys(paths: &[&str]) -> DocumentKeySet {
    paths.iter().map(|p| key(p)).collect()
}

#[test]
fn test_changes_for_pending_targets_are_dropped() {
    let metadata = TestMetadata::with_rooms(&[]);
    let mut aggregator = WatchChangeAggregator::new();
    aggregator.record_pending_target_request(ROOMS);

    aggregator.handle_document_change(&update(ROOMS, doc("rooms/a", 1, json!({}))), &metadata);
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.document_updates.is_empty());
    assert!(event.target_changes.is_empty());
}

#[test]
fn test_new_and_known_documents() {
    let metadata = TestMetadata::with_rooms(&["rooms/a"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_document_change(&update(ROOMS, doc("rooms/a", 5, json!({"v": 2}))), &metadata);
    aggregator.handle_document_change(&update(ROOMS, doc("rooms/b", 5, json!({}))), &metadata);
    let event = aggregator.create_remote_event(version(10), &metadata);

    let change = &event.target_changes[&ROOMS];
    assert_eq!(change.added_documents, keys(&["rooms/b"]));
    assert_eq!(change.modified_documents, keys(&["rooms/a"]));
    assert_eq!(event.document_updates.len(), 2);
    assert!(event
        .document_updates
        .values()
        .all(|d| d.read_time() == version(10)));
    assert!(event.resolved_limbo_documents.is_empty());
}

#[test]
fn test_added_then_removed_before_snapshot_cancels() {
    let metadata = TestMetadata::with_rooms(&[]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_document_change(&update(ROOMS, doc("rooms/a", 5, json!({}))), &metadata);
    aggregator.handle_document_change(&removal(ROOMS, "rooms/a"), &metadata);
    let event = aggregator.create_remote_event(version(10), &metadata);

    let change = &event.target_changes[&ROOMS];
    assert!(change.is_empty());
}

#[test]
fn test_removed_known_document_is_reported() {
    let metadata = TestMetadata::with_rooms(&["rooms/a"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_document_change(&removal(ROOMS, "rooms/a"), &metadata);
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert_eq!(event.target_changes[&ROOMS].removed_documents, keys(&["rooms/a"]));
    // Only membership changed, so there is no document update.
    assert!(event.document_updates.is_empty());
}

#[test]
fn test_current_and_resume_token() {
    let metadata = TestMetadata::with_rooms(&[]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_target_change(
        &WatchTargetChange::new(WatchTargetChangeState::Current, vec![ROOMS]).with_resume_token(b"t1".to_vec()),
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    let change = &event.target_changes[&ROOMS];
    assert!(change.current);
    assert_eq!(change.resume_token, b"t1".to_vec());

    // Nothing new: the target is not part of the next event.
    let event = aggregator.create_remote_event(version(11), &metadata);
    assert!(event.target_changes.is_empty());

    // A global token applies to every active target.
    aggregator.handle_target_change(
        &WatchTargetChange::global_snapshot(version(12), b"t2".to_vec()),
        &metadata,
    );
    let event = aggregator.create_remote_event(version(12), &metadata);
    assert_eq!(event.target_changes[&ROOMS].resume_token, b"t2".to_vec());
}

#[test]
fn test_reset_removes_every_known_document() {
    let metadata = TestMetadata::with_rooms(&["rooms/a", "rooms/b"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_target_change(
        &WatchTargetChange::new(WatchTargetChangeState::Reset, vec![ROOMS]),
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert_eq!(
        event.target_changes[&ROOMS].removed_documents,
        keys(&["rooms/a", "rooms/b"])
    );
}

#[test]
fn test_existence_filter_mismatch_resets_target() {
    let metadata = TestMetadata::with_rooms(&["rooms/a", "rooms/b"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_existence_filter(
        &ExistenceFilterChange {
            target_id: ROOMS,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: None,
            },
        },
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert_eq!(
        event.target_mismatches.get(&ROOMS),
        Some(&TargetPurpose::ExistenceFilterMismatch)
    );
    assert_eq!(event.target_changes[&ROOMS].removed_documents.len(), 2);
}

#[test]
fn test_matching_existence_filter_changes_nothing() {
    let metadata = TestMetadata::with_rooms(&["rooms/a", "rooms/b"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);
    aggregator.create_remote_event(version(9), &metadata);

    aggregator.handle_existence_filter(
        &ExistenceFilterChange {
            target_id: ROOMS,
            filter: ExistenceFilter {
                count: 2,
                unchanged_names: None,
            },
        },
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.target_mismatches.is_empty());
    assert!(event.target_changes.is_empty());
}

#[test]
fn test_bloom_filter_explains_mismatch() {
    let metadata = TestMetadata::with_rooms(&["rooms/a", "rooms/b"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    let mut bloom = BloomFilter::with_size(1024, 7);
    bloom.insert("rooms/a");
    aggregator.handle_existence_filter(
        &ExistenceFilterChange {
            target_id: ROOMS,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(bloom.to_data()),
            },
        },
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.target_mismatches.is_empty());
    assert_eq!(event.target_changes[&ROOMS].removed_documents, keys(&["rooms/b"]));
}

#[test]
#[traced_test]
fn test_malformed_bloom_filter_falls_back_to_reset() {
    let metadata = TestMetadata::with_rooms(&["rooms/a", "rooms/b"]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);

    aggregator.handle_existence_filter(
        &ExistenceFilterChange {
            target_id: ROOMS,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(BloomFilterData {
                    bitmap: vec![0xff],
                    padding: 9,
                    hash_count: 1,
                }),
            },
        },
        &metadata,
    );
    assert!(logs_contain("ignoring malformed bloom filter"));
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert_eq!(
        event.target_mismatches.get(&ROOMS),
        Some(&TargetPurpose::ExistenceFilterMismatch)
    );
}

#[test]
fn test_current_limbo_target_without_document_deletes_it() {
    let metadata = TestMetadata::with_rooms(&["rooms/a"]).with_limbo("rooms/b");
    let mut aggregator = acknowledged(&[ROOMS, LIMBO], &metadata);

    aggregator.handle_target_change(
        &WatchTargetChange::new(WatchTargetChangeState::Current, vec![LIMBO]),
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);

    let deleted = &event.document_updates[&key("rooms/b")];
    assert!(deleted.is_no_document());
    assert_eq!(deleted.version(), version(10));
    assert_eq!(event.resolved_limbo_documents, keys(&["rooms/b"]));
}

#[test]
fn test_document_in_query_target_is_not_resolved_limbo() {
    let metadata = TestMetadata::with_rooms(&[]).with_limbo("rooms/b");
    let mut aggregator = acknowledged(&[ROOMS, LIMBO], &metadata);

    let document = doc("rooms/b", 5, json!({}));
    aggregator.handle_document_change(
        &DocumentWatchChange {
            updated_target_ids: vec![ROOMS, LIMBO],
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        },
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.resolved_limbo_documents.is_empty());
}

#[test]
fn test_zero_count_on_document_target_deletes_document() {
    let metadata = TestMetadata::default().with_limbo("rooms/b");
    let mut aggregator = acknowledged(&[LIMBO], &metadata);

    aggregator.handle_existence_filter(
        &ExistenceFilterChange {
            target_id: LIMBO,
            filter: ExistenceFilter {
                count: 0,
                unchanged_names: None,
            },
        },
        &metadata,
    );
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.document_updates[&key("rooms/b")].is_no_document());
    assert!(event.target_mismatches.is_empty());
}

#[test]
fn test_removed_target_drops_its_state() {
    let metadata = TestMetadata::with_rooms(&[]);
    let mut aggregator = acknowledged(&[ROOMS], &metadata);
    aggregator.handle_document_change(&update(ROOMS, doc("rooms/a", 5, json!({}))), &metadata);

    aggregator.remove_target(ROOMS);
    let event = aggregator.create_remote_event(version(10), &metadata);
    assert!(event.target_changes.is_empty());
}
