use super::*;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::test_utils::key;
use crate::test_utils::path;
use crate::test_utils::version;
use crate::DocumentKeySet;
use crate::MemoryStorage;
use crate::Query;
use crate::SnapshotVersion;
use crate::Target;
use crate::TargetData;
use crate::TargetPurpose;

fn target(collection: &str) -> Target {
    Query::collection(path(collection)).unwrap().to_target()
}

fn save(
    cache: &mut TargetCache,
    storage: &MemoryStorage,
    collection: &str,
) -> TargetData {
    let target_id = cache.allocate_target_id();
    let sequence_number = cache.next_sequence_number();
    let data = TargetData::new(target(collection), target_id, TargetPurpose::Listen, sequence_number);
    let mut batch = WriteBatch::default();
    cache.save_target_data(data.clone(), &mut batch).unwrap();
    storage.apply(batch).unwrap();
    data
}

#[test]
fn test_target_ids_are_even_and_continue_after_reload() {
    let storage = MemoryStorage::new();
    let mut cache = TargetCache::load(&storage).unwrap();
    assert_eq!(save(&mut cache, &storage, "rooms").target_id, 2);
    assert_eq!(save(&mut cache, &storage, "users").target_id, 4);
    assert_eq!(cache.highest_target_id(), 4);

    let mut reloaded = TargetCache::load(&storage).unwrap();
    assert_eq!(reloaded.target_count(), 2);
    assert_eq!(reloaded.highest_sequence_number(), 2);
    assert_eq!(reloaded.allocate_target_id(), 6);
}

#[test]
fn test_lookup_by_target_and_id() {
    let storage = MemoryStorage::new();
    let mut cache = TargetCache::load(&storage).unwrap();
    let rooms = save(&mut cache, &storage, "rooms");

    assert_eq!(cache.get_target_data(&target("rooms")), Some(&rooms));
    assert_eq!(cache.get_target_data_by_id(rooms.target_id), Some(&rooms));
    assert!(cache.get_target_data(&target("users")).is_none());
}

#[test]
fn test_matching_keys_are_persisted_per_target() {
    let storage = MemoryStorage::new();
    let mut cache = TargetCache::load(&storage).unwrap();
    let rooms = save(&mut cache, &storage, "rooms");
    let users = save(&mut cache, &storage, "users");

    let mut batch = WriteBatch::default();
    cache.add_matching_keys(&[key("rooms/a"), key("rooms/b")], rooms.target_id, &mut batch);
    cache.add_matching_keys(&[key("users/u")], users.target_id, &mut batch);
    cache.remove_matching_keys(&[key("rooms/b")], rooms.target_id, &mut batch);
    storage.apply(batch).unwrap();

    let reloaded = TargetCache::load(&storage).unwrap();
    assert_eq!(
        reloaded.get_matching_keys_for_target_id(rooms.target_id),
        DocumentKeySet::from([key("rooms/a")])
    );
    assert!(reloaded.contains_key(&key("users/u")));
    assert!(!reloaded.contains_key(&key("rooms/b")));
}

#[test]
fn test_removing_target_drops_its_keys() {
    let storage = MemoryStorage::new();
    let mut cache = TargetCache::load(&storage).unwrap();
    let rooms = save(&mut cache, &storage, "rooms");

    let mut batch = WriteBatch::default();
    cache.add_matching_keys(&[key("rooms/a")], rooms.target_id, &mut batch);
    cache.remove_target_data(rooms.target_id, &mut batch);
    storage.apply(batch).unwrap();

    assert!(cache.get_target_data(&target("rooms")).is_none());
    assert!(!cache.contains_key(&key("rooms/a")));
    let reloaded = TargetCache::load(&storage).unwrap();
    assert_eq!(reloaded.target_count(), 0);
    assert!(!reloaded.contains_key(&key("rooms/a")));
}

#[test]
fn test_last_remote_snapshot_version_is_persisted() {
    let storage = MemoryStorage::new();
    let mut cache = TargetCache::load(&storage).unwrap();
    assert_eq!(cache.last_remote_snapshot_version(), SnapshotVersion::MIN);

    let mut batch = WriteBatch::default();
    cache
        .set_last_remote_snapshot_version(version(5_000), &mut batch)
        .unwrap();
    storage.apply(batch).unwrap();

    assert_eq!(
        TargetCache::load(&storage).unwrap().last_remote_snapshot_version(),
        version(5_000)
    );
}
