use serde_json::json;

use super::*;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::test_utils::delete_mutation;
use crate::test_utils::key;
use crate::test_utils::path;
use crate::test_utils::set_mutation;
use crate::BatchId;
use crate::Code;
use crate::MemoryStorage;
use crate::MutationBatch;
use crate::Timestamp;
use crate::User;
use crate::BATCH_ID_UNKNOWN;

fn add(
    queue: &mut MutationQueue,
    storage: &MemoryStorage,
    paths: &[&str],
) -> BatchId {
    let mutations = paths.iter().map(|p| set_mutation(p, json!({"n": 1}))).collect();
    let mut batch = WriteBatch::default();
    let added = queue
        .add_mutation_batch(Timestamp::now(), mutations, &mut batch)
        .unwrap();
    storage.apply(batch).unwrap();
    added.batch_id
}

fn remove(
    queue: &mut MutationQueue,
    storage: &MemoryStorage,
    batch_id: BatchId,
) {
    let mut batch = WriteBatch::default();
    queue.remove_mutation_batch(batch_id, &mut batch).unwrap();
    storage.apply(batch).unwrap();
}

fn ids(batches: Vec<&MutationBatch>) -> Vec<BatchId> {
    batches.into_iter().map(|b| b.batch_id).collect()
}

#[test]
fn test_batch_ids_increase_and_survive_reload() {
    let storage = MemoryStorage::new();
    let user = User::unauthenticated();
    let mut queue = MutationQueue::load(&storage, &user).unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);

    let first = add(&mut queue, &storage, &["rooms/a"]);
    let second = add(&mut queue, &storage, &["rooms/b"]);
    assert!(second > first);
    assert_eq!(queue.highest_unacknowledged_batch_id(), second);

    let reloaded = MutationQueue::load(&storage, &user).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.next_mutation_batch_after_batch_id(first).map(|b| b.batch_id), Some(second));
}

#[test]
fn test_batch_ids_are_not_reused_after_removal() {
    let storage = MemoryStorage::new();
    let user = User::unauthenticated();
    let mut queue = MutationQueue::load(&storage, &user).unwrap();
    let first = add(&mut queue, &storage, &["rooms/a"]);
    remove(&mut queue, &storage, first);
    assert!(queue.is_empty());

    let mut reloaded = MutationQueue::load(&storage, &user).unwrap();
    let next = add(&mut reloaded, &storage, &["rooms/b"]);
    assert!(next > first);
}

#[test]
fn test_only_the_head_batch_can_be_removed() {
    let storage = MemoryStorage::new();
    let mut queue = MutationQueue::load(&storage, &User::unauthenticated()).unwrap();
    let first = add(&mut queue, &storage, &["rooms/a"]);
    let second = add(&mut queue, &storage, &["rooms/b"]);

    let mut batch = WriteBatch::default();
    let error = queue.remove_mutation_batch(second, &mut batch).unwrap_err();
    assert_eq!(error.code(), Code::Internal);
    assert!(batch.is_empty());

    remove(&mut queue, &storage, first);
    assert!(queue.lookup_mutation_batch(first).is_none());
    assert!(queue.lookup_mutation_batch(second).is_some());
}

#[test]
fn test_batches_affecting_keys_and_collections() {
    let storage = MemoryStorage::new();
    let mut queue = MutationQueue::load(&storage, &User::unauthenticated()).unwrap();
    let first = add(&mut queue, &storage, &["rooms/a", "rooms/b"]);
    let second = add(&mut queue, &storage, &["rooms/b/messages/m1"]);
    let third = add(&mut queue, &storage, &["rooms/b"]);

    assert_eq!(
        ids(queue.all_mutation_batches_affecting_document_key(&key("rooms/b"))),
        vec![first, third]
    );
    assert_eq!(
        ids(queue.all_mutation_batches_affecting_collection(&path("rooms"))),
        vec![first, third]
    );
    assert_eq!(
        ids(queue.all_mutation_batches_affecting_collection(&path("rooms/b/messages"))),
        vec![second]
    );
    assert_eq!(queue.mutated_keys().len(), 3);

    remove(&mut queue, &storage, first);
    assert_eq!(
        ids(queue.all_mutation_batches_affecting_document_key(&key("rooms/a"))),
        Vec::<BatchId>::new()
    );
}

#[test]
fn test_queues_are_isolated_per_user() {
    let storage = MemoryStorage::new();
    let mut anonymous = MutationQueue::load(&storage, &User::unauthenticated()).unwrap();
    add(&mut anonymous, &storage, &["rooms/a"]);

    let mut ann = MutationQueue::load(&storage, &User::new("ann")).unwrap();
    assert!(ann.is_empty());
    let mut batch = WriteBatch::default();
    ann.add_mutation_batch(Timestamp::now(), vec![delete_mutation("rooms/a")], &mut batch)
        .unwrap();
    storage.apply(batch).unwrap();

    assert_eq!(MutationQueue::load(&storage, &User::unauthenticated()).unwrap().len(), 1);
    assert_eq!(MutationQueue::load(&storage, &User::new("ann")).unwrap().len(), 1);
}

#[test]
fn test_stream_token_is_persisted() {
    let storage = MemoryStorage::new();
    let user = User::new("ann");
    let mut queue = MutationQueue::load(&storage, &user).unwrap();
    assert!(queue.last_stream_token().is_empty());

    let mut batch = WriteBatch::default();
    queue.set_last_stream_token(b"token".to_vec(), &mut batch).unwrap();
    storage.apply(batch).unwrap();

    let reloaded = MutationQueue::load(&storage, &user).unwrap();
    assert_eq!(reloaded.last_stream_token(), b"token");
}

#[test]
fn test_discard_drops_only_the_newest_batch() {
    let storage = MemoryStorage::new();
    let mut queue = MutationQueue::load(&storage, &User::unauthenticated()).unwrap();
    let first = add(&mut queue, &storage, &["rooms/a"]);
    let second = add(&mut queue, &storage, &["rooms/b"]);

    queue.discard_unpersisted_batch(first);
    assert_eq!(queue.len(), 2);

    queue.discard_unpersisted_batch(second);
    assert_eq!(queue.len(), 1);
    assert!(queue.all_mutation_batches_affecting_document_key(&key("rooms/b")).is_empty());
}
