use std::sync::Arc;

use tracing_test::traced_test;

use super::*;
use crate::Error;
use crate::StorageError;

fn check_basic_operations(storage: &dyn LocalStorage) {
    storage.put(Keyspace::Documents, b"users/1", b"ann").unwrap();
    storage.put(Keyspace::Documents, b"users/2", b"bob").unwrap();
    storage.put(Keyspace::Documents, b"usersx/1", b"other").unwrap();
    storage.put(Keyspace::Targets, b"users/1", b"target").unwrap();

    assert_eq!(
        storage.get(Keyspace::Documents, b"users/1").unwrap(),
        Some(b"ann".to_vec())
    );
    assert_eq!(
        storage.get(Keyspace::Targets, b"users/1").unwrap(),
        Some(b"target".to_vec())
    );

    let scanned = storage.scan_prefix(Keyspace::Documents, b"users/").unwrap();
    assert_eq!(
        scanned,
        vec![
            (b"users/1".to_vec(), b"ann".to_vec()),
            (b"users/2".to_vec(), b"bob".to_vec()),
        ]
    );

    storage.delete(Keyspace::Documents, b"users/1").unwrap();
    assert_eq!(storage.get(Keyspace::Documents, b"users/1").unwrap(), None);
}

fn check_batch_spans_keyspaces(storage: &dyn LocalStorage) {
    let mut batch = WriteBatch::default();
    batch.put(Keyspace::Mutations, b"a".to_vec(), b"1".to_vec());
    batch.put(Keyspace::Globals, b"a".to_vec(), b"2".to_vec());
    batch.delete(Keyspace::Mutations, b"missing".to_vec());
    storage.apply(batch).unwrap();

    assert_eq!(storage.get(Keyspace::Mutations, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(storage.get(Keyspace::Globals, b"a").unwrap(), Some(b"2".to_vec()));
    assert_eq!(storage.scan_prefix(Keyspace::Mutations, b"").unwrap().len(), 1);
}

#[test]
fn test_memory_storage_basic_operations() {
    let storage = MemoryStorage::new();
    check_basic_operations(&storage);
    check_batch_spans_keyspaces(&storage);
}

#[test]
fn test_sled_storage_basic_operations() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SledStorage::open(dir.path()).unwrap();
    check_basic_operations(&storage);
    check_batch_spans_keyspaces(&storage);
    storage.flush().unwrap();
    assert!(storage.db_size().unwrap() > 0);
}

#[test]
fn test_sled_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = SledStorage::open(dir.path()).unwrap();
        storage.put(Keyspace::Globals, b"k", b"v").unwrap();
        storage.flush().unwrap();
    }
    let storage = SledStorage::open(dir.path()).unwrap();
    assert_eq!(storage.get(Keyspace::Globals, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_records_round_trip_through_storage() {
    let storage = MemoryStorage::new();
    let mut batch = WriteBatch::default();
    batch.put_record(Keyspace::Globals, b"n".to_vec(), &42u64).unwrap();
    storage.apply(batch).unwrap();

    let value: Option<u64> = read_record(&storage, Keyspace::Globals, b"n").unwrap();
    assert_eq!(value, Some(42));
    let missing: Option<u64> = read_record(&storage, Keyspace::Globals, b"x").unwrap();
    assert_eq!(missing, None);
}

#[test]
#[traced_test]
fn test_persistence_refuses_writes_after_failed_commit() {
    let mut mock = MockLocalStorage::new();
    mock.expect_apply()
        .times(1)
        .returning(|_| Err(StorageError::Backend("disk full".to_string()).into()));

    let mut persistence = Persistence::new(Arc::new(mock));
    let mut batch = WriteBatch::default();
    batch.put(Keyspace::Globals, b"k".to_vec(), b"v".to_vec());

    let first = persistence.commit("write", batch.clone());
    assert!(matches!(first, Err(Error::PrimaryLeaseLost(_))));
    assert!(persistence.is_primary_lease_lost());

    // No second call reaches the storage
    let second = persistence.commit("write", batch);
    assert!(matches!(second, Err(Error::PrimaryLeaseLost(_))));
    assert!(logs_contain("local writes disabled"));
}

#[test]
fn test_persistence_skips_empty_batches() {
    let mut mock = MockLocalStorage::new();
    mock.expect_apply().times(0);

    let mut persistence = Persistence::new(Arc::new(mock));
    persistence.commit("noop", WriteBatch::default()).unwrap();
}

#[test]
fn test_init_storage_selects_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = crate::PersistenceConfig::default();
    let memory = init_storage(&config).unwrap();
    memory.put(Keyspace::Globals, b"k", b"v").unwrap();

    config.enabled = true;
    config.db_path = dir.path().join("db");
    let disk = init_storage(&config).unwrap();
    assert_eq!(disk.get(Keyspace::Globals, b"k").unwrap(), None);
}
