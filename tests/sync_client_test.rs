mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::ack;
use common::start_client;
use common::version;
use common::ScriptedBackend;
use docsync::Document;
use docsync::DocumentWatchChange;
use docsync::Error;
use docsync::ListenOptions;
use docsync::ListenRequest;
use docsync::LocalStorage;
use docsync::MemoryStorage;
use docsync::ObjectValue;
use docsync::Operator;
use docsync::SetOptions;
use docsync::SledStorage;
use docsync::Value;
use docsync::WatchChange;
use docsync::WatchTargetChange;
use docsync::WatchTargetChangeState;
use docsync::WriteRequest;
use serde_json::json;
use tempfile::TempDir;

fn sled_storage(dir: &TempDir) -> Arc<dyn LocalStorage> {
    Arc::new(SledStorage::open(dir.path().join("db")).expect("open sled"))
}

#[tokio::test]
async fn test_offline_writes_reach_listeners_from_cache() {
    let client = start_client(Arc::new(MemoryStorage::new()), None).await;
    client
        .write(&client.doc("rooms/a").unwrap(), json!({"size": 1}), SetOptions::Overwrite)
        .await
        .unwrap();

    let mut rooms = client
        .listen(client.collection("rooms").unwrap(), ListenOptions::default())
        .await
        .unwrap();
    let first = rooms.next().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert!(first.metadata().from_cache);
    assert!(first.metadata().has_pending_writes);

    client
        .write(&client.doc("rooms/b").unwrap(), json!({"size": 2}), SetOptions::Overwrite)
        .await
        .unwrap();
    let second = rooms.next().await.unwrap().unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second.changes().len(), 1);

    let filtered = client
        .collection("rooms")
        .unwrap()
        .where_field("size", Operator::GreaterThan, 1i64)
        .unwrap();
    let snapshot = client.get_query(&filtered).await.unwrap();
    assert_eq!(snapshot.keys(), vec![client.doc("rooms/b").unwrap()]);
}

#[tokio::test]
async fn test_merge_write_combines_with_offline_set() {
    let client = start_client(Arc::new(MemoryStorage::new()), None).await;
    let key = client.doc("users/42").unwrap();
    client
        .write(&key, json!({"name": "Ann"}), SetOptions::Overwrite)
        .await
        .unwrap();
    client
        .write(&key, json!({"age": 30}), SetOptions::Merge)
        .await
        .unwrap();

    let snapshot = client.get(&key).await.unwrap();
    assert_eq!(snapshot.to_json(), Some(json!({"name": "Ann", "age": 30})));
    assert!(snapshot.metadata().from_cache);
}

#[tokio::test]
async fn test_pending_write_survives_restart_and_commits() {
    let dir = TempDir::new().unwrap();
    let storage = sled_storage(&dir);

    let offline = start_client(storage.clone(), None).await;
    let key = offline.doc("rooms/eros").unwrap();
    let pending = offline
        .write(&key, json!({"name": "Eros"}), SetOptions::Overwrite)
        .await
        .unwrap();
    offline.shutdown().await.unwrap();
    assert!(matches!(pending.committed().await, Err(Error::ClientTerminated)));

    let backend = ScriptedBackend::new();
    let online = start_client(storage, Some(backend.clone())).await;
    let restored = online.get(&key).await.unwrap();
    assert!(restored.metadata().has_pending_writes);

    let mut write = backend.accept_write_stream().await;
    match write.next_request().await {
        WriteRequest::Mutations { writes, .. } => {
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].key, key);
        }
        other => panic!("unexpected request {:?}", other),
    }
    write.respond(ack(1, 10)).await;
    online.wait_for_pending_writes().await.unwrap();

    let committed = online.get(&key).await.unwrap();
    assert!(!committed.metadata().has_pending_writes);
    assert_eq!(committed.version(), Some(version(10)));
    assert_eq!(committed.to_json(), Some(json!({"name": "Eros"})));
}

#[tokio::test]
async fn test_watched_documents_stay_cached_across_restart() {
    let dir = TempDir::new().unwrap();
    let storage = sled_storage(&dir);
    let backend = ScriptedBackend::new();
    let client = start_client(storage.clone(), Some(backend.clone())).await;
    let key = client.doc("rooms/eros").unwrap();

    let mut rooms = client
        .listen(client.collection("rooms").unwrap(), ListenOptions::default())
        .await
        .unwrap();
    let mut watch = backend.next_watch_stream().await;
    let target_id = match watch.next_request().await {
        ListenRequest::AddTarget { target_id, .. } => target_id,
        other => panic!("unexpected request {:?}", other),
    };
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), Value::from("Eros"));
    for change in [
        WatchChange::Target(WatchTargetChange::new(WatchTargetChangeState::Added, vec![target_id])),
        WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: key.clone(),
            document: Some(Document::new_found(key.clone(), version(5), ObjectValue::from(fields))),
        }),
        WatchChange::Target(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                .with_resume_token(b"resume".to_vec()),
        ),
        WatchChange::Target(WatchTargetChange::global_snapshot(version(5), b"resume".to_vec())),
    ] {
        watch.respond(change).await;
    }

    let synced = rooms.next().await.unwrap().unwrap();
    assert_eq!(synced.len(), 1);
    assert!(!synced.metadata().from_cache);
    drop(rooms);
    client.shutdown().await.unwrap();

    let restarted = start_client(storage, None).await;
    let cached = restarted
        .get_query(&restarted.collection("rooms").unwrap())
        .await
        .unwrap();
    assert_eq!(cached.keys(), vec![key]);
    assert!(cached.metadata().from_cache);
    assert!(!cached.metadata().has_pending_writes);
}
