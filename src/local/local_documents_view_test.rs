use serde_json::json;

use super::*;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::test_utils::delete_mutation;
use crate::test_utils::doc;
use crate::test_utils::key;
use crate::test_utils::merge_mutation;
use crate::test_utils::object;
use crate::test_utils::patch_mutation;
use crate::test_utils::path;
use crate::test_utils::set_mutation;
use crate::test_utils::version;
use crate::Document;
use crate::MemoryStorage;
use crate::Mutation;
use crate::MutationKind;
use crate::Timestamp;
use crate::User;

struct Fixture {
    storage: MemoryStorage,
    remote: RemoteDocumentCache,
    queue: MutationQueue,
    overlays: OverlayCache,
}

impl Fixture {
    fn new() -> Self {
        let storage = MemoryStorage::new();
        let remote = RemoteDocumentCache::load(&storage).unwrap();
        let queue = MutationQueue::load(&storage, &User::unauthenticated()).unwrap();
        Self {
            storage,
            remote,
            queue,
            overlays: OverlayCache::new(),
        }
    }

    fn cache(
        &mut self,
        mut document: Document,
    ) {
        let mut changes = RemoteDocumentChangeBuffer::default();
        let read_time = document.version();
        document.set_read_time(read_time);
        changes.add_entry(document);
        let mut batch = WriteBatch::default();
        self.remote.apply_changes(changes, &mut batch).unwrap();
        self.storage.apply(batch).unwrap();
    }

    fn write(
        &mut self,
        mutations: Vec<Mutation>,
    ) {
        let keys: Vec<_> = mutations.iter().map(|m| m.key.clone()).collect();
        let mut batch = WriteBatch::default();
        self.queue
            .add_mutation_batch(Timestamp::now(), mutations, &mut batch)
            .unwrap();
        self.overlays.invalidate(&keys);
    }

    fn view(&mut self) -> LocalDocumentsView<'_> {
        LocalDocumentsView {
            remote_documents: &self.remote,
            mutation_queue: &self.queue,
            overlays: &mut self.overlays,
        }
    }
}

#[test]
fn test_document_without_writes_is_the_cached_one() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a"})));

    let view = fixture.view().get_document(&key("rooms/a"));
    assert!(view.is_found_document());
    assert!(!view.has_local_mutations());
    assert_eq!(view.data(), &object(json!({"name": "a"})));
    assert_eq!(fixture.overlays.len(), 0);
}

#[test]
fn test_queued_writes_apply_in_order() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a", "size": 1})));
    fixture.write(vec![patch_mutation("rooms/a", json!({"size": 2}))]);
    fixture.write(vec![patch_mutation("rooms/a", json!({"owner": "ann"}))]);

    let view = fixture.view().get_document(&key("rooms/a"));
    assert!(view.has_local_mutations());
    assert_eq!(view.data(), &object(json!({"name": "a", "size": 2, "owner": "ann"})));
    assert_eq!(view.version(), version(1_000));
}

#[test]
fn test_patch_of_missing_document_has_no_view() {
    let mut fixture = Fixture::new();
    fixture.write(vec![patch_mutation("rooms/a", json!({"size": 2}))]);
    assert!(!fixture.view().get_document(&key("rooms/a")).is_found_document());
}

#[test]
fn test_delete_yields_no_document() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a"})));
    fixture.write(vec![delete_mutation("rooms/a")]);

    let view = fixture.view().get_document(&key("rooms/a"));
    assert!(view.is_no_document());
    assert!(view.has_local_mutations());
}

#[test]
fn test_views_are_memoized_as_overlays() {
    let mut fixture = Fixture::new();
    fixture.write(vec![set_mutation("rooms/a", json!({"name": "local"}))]);

    let first = fixture.view().get_document(&key("rooms/a"));
    assert_eq!(fixture.overlays.len(), 1);
    assert!(matches!(
        fixture.overlays.overlay(&key("rooms/a")).map(|m| &m.kind),
        Some(MutationKind::Set(_))
    ));

    let second = fixture.view().get_document(&key("rooms/a"));
    assert_eq!(first, second);

    fixture.write(vec![patch_mutation("rooms/a", json!({"size": 3}))]);
    assert_eq!(fixture.overlays.len(), 0);
    let third = fixture.view().get_document(&key("rooms/a"));
    assert_eq!(third.data(), &object(json!({"name": "local", "size": 3})));
}

#[test]
fn test_memoized_view_follows_new_remote_document() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a", "size": 1})));
    fixture.write(vec![merge_mutation("rooms/a", json!({"size": 2}), &["size"])]);
    fixture.view().get_document(&key("rooms/a"));

    fixture.cache(doc("rooms/a", 2_000, json!({"name": "b", "size": 1})));
    let view = fixture.view().get_document(&key("rooms/a"));
    assert_eq!(view.data(), &object(json!({"name": "b", "size": 2})));
    assert_eq!(view.version(), version(2_000));
    assert!(view.has_local_mutations());
}

#[test]
fn test_precondition_chain_is_not_memoized_as_overlay() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a"})));
    fixture.write(vec![patch_mutation("rooms/a", json!({"size": 2}))]);
    assert!(fixture.view().get_document(&key("rooms/a")).is_found_document());
    assert!(fixture.overlays.overlay(&key("rooms/a")).is_none());

    fixture.cache(Document::new_no_document(key("rooms/a"), version(2_000)));
    let view = fixture.view().get_document(&key("rooms/a"));
    assert!(view.is_no_document());
}

#[test]
fn test_collection_view_includes_local_only_documents() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({"name": "a"})));
    fixture.cache(doc("rooms/a/messages/m", 1_000, json!({})));
    fixture.write(vec![set_mutation("rooms/b", json!({"name": "b"}))]);
    fixture.write(vec![set_mutation("users/u", json!({}))]);

    let collection = fixture.view().get_documents_matching_collection(&path("rooms"), None);
    assert_eq!(collection.documents_read, 1);
    assert_eq!(
        collection.documents.keys().cloned().collect::<Vec<_>>(),
        vec![key("rooms/a"), key("rooms/b")]
    );
    assert!(collection.documents[&key("rooms/b")].has_local_mutations());

    let mutated = fixture.view().get_locally_mutated_in_collection(&path("rooms"));
    assert_eq!(mutated.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
}

#[test]
fn test_collection_view_since_read_time_keeps_local_writes() {
    let mut fixture = Fixture::new();
    fixture.cache(doc("rooms/a", 1_000, json!({})));
    fixture.cache(doc("rooms/b", 3_000, json!({})));
    fixture.write(vec![patch_mutation("rooms/a", json!({"size": 1}))]);

    let collection = fixture
        .view()
        .get_documents_matching_collection(&path("rooms"), Some(version(2_000)));
    assert_eq!(collection.documents_read, 1);
    assert_eq!(collection.documents.len(), 2);
}
