//! Durability flows: local snapshots, offline recovery, and remote persistence
//! through real engines.

use std::path::Path;
use std::sync::Arc;
use tandem_sync::{
    EngineConfig, LocalIdentity, LocalStore, LocalStoreConfig, MemoryFanout, MemoryHub,
    MemoryRemoteStore, NetworkStatus, RealtimeTransport, SyncEngine,
};
use tempfile::TempDir;
use tokio::time::{sleep, Duration};
use uuid::Uuid;
use yrs::{GetString, Text, Transact};

fn engine_at(
    user: &str,
    path: &Path,
    hub: &Arc<MemoryHub>,
    remote: &Arc<MemoryRemoteStore>,
    network: &NetworkStatus,
) -> SyncEngine {
    SyncEngine::new(
        LocalIdentity {
            user_id: user.to_string(),
            name: user.to_string(),
            avatar_url: None,
        },
        hub.clone() as Arc<dyn RealtimeTransport>,
        Arc::new(MemoryFanout::with_defaults()),
        Arc::new(LocalStore::open(LocalStoreConfig::for_testing(path)).unwrap()),
        remote.clone(),
        network.clone(),
        EngineConfig::for_testing(),
    )
}

fn make_engine(
    user: &str,
    hub: &Arc<MemoryHub>,
    remote: &Arc<MemoryRemoteStore>,
    network: &NetworkStatus,
) -> (SyncEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = engine_at(user, dir.path(), hub, remote, network);
    (engine, dir)
}

fn insert_text(doc: &yrs::Doc, text: &str) {
    let root = doc.get_or_insert_text("content");
    let mut txn = doc.transact_mut();
    let len = root.get_string(&txn).len() as u32;
    root.insert(&mut txn, len, text);
}

fn read_text(doc: &yrs::Doc) -> String {
    let root = doc.get_or_insert_text("content");
    let txn = doc.transact();
    root.get_string(&txn)
}

async fn settle() {
    sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_offline_edits_survive_restart() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(false);
    let doc_id = Uuid::new_v4();
    let dir = TempDir::new().unwrap();

    {
        let engine = engine_at("alice", dir.path(), &hub, &remote, &network);
        let provider = engine.open(doc_id, "note").await.unwrap();
        provider.enable_offline().unwrap();
        insert_text(provider.doc(), "offline work");
        engine.close_all().await;
    }

    // Still offline: the restarted engine loads purely from RocksDB.
    let engine = engine_at("alice", dir.path(), &hub, &remote, &network);
    let provider = engine.open(doc_id, "note").await.unwrap();
    assert_eq!(read_text(provider.doc()), "offline work");
    assert!(provider.is_offline_enabled());
    assert_eq!(remote.row_count(), 0);

    engine.close_all().await;
}

#[tokio::test]
async fn test_reconnect_persists_offline_work() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(false);
    let doc_id = Uuid::new_v4();

    let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
    let provider = engine.open(doc_id, "note").await.unwrap();
    provider.enable_offline().unwrap();
    insert_text(provider.doc(), "made offline");
    sleep(Duration::from_millis(100)).await;

    network.set_online(true);
    sleep(Duration::from_millis(400)).await;

    // The network watcher forced a persist of the offline work.
    assert_eq!(remote.row_count(), 1);
    assert!(!provider.is_dirty());

    engine.close_all().await;
}

#[tokio::test]
async fn test_divergent_replicas_converge_via_remote() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let doc_id = Uuid::new_v4();

    // Alice works connected and persists.
    let network_a = NetworkStatus::new(true);
    let (engine_a, _da) = make_engine("alice", &hub, &remote, &network_a);
    let a = engine_a.open(doc_id, "note").await.unwrap();
    insert_text(a.doc(), "alice-line ");
    settle().await;
    a.persist_remote().await.unwrap();
    engine_a.close_all().await;

    // Bob was never on the channel with alice; he loads from the remote
    // store and adds his own line.
    let network_b = NetworkStatus::new(true);
    let (engine_b, _db) = make_engine("bob", &hub, &remote, &network_b);
    let b = engine_b.open(doc_id, "note").await.unwrap();
    assert!(read_text(b.doc()).contains("alice-line"));
    insert_text(b.doc(), "bob-line");
    settle().await;
    b.persist_remote().await.unwrap();
    engine_b.close_all().await;

    // A third participant sees the union.
    let network_c = NetworkStatus::new(true);
    let (engine_c, _dc) = make_engine("carol", &hub, &remote, &network_c);
    let c = engine_c.open(doc_id, "note").await.unwrap();
    let text = read_text(c.doc());
    assert!(text.contains("alice-line"));
    assert!(text.contains("bob-line"));
    engine_c.close_all().await;
}

#[tokio::test]
async fn test_failed_persist_leaves_doc_dirty_and_retryable() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();

    let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
    let provider = engine.open(doc_id, "note").await.unwrap();
    insert_text(provider.doc(), "must not be lost");
    settle().await;

    remote.set_unavailable(true);
    assert!(provider.persist_remote().await.is_err());
    assert!(provider.is_dirty());
    assert_eq!(remote.row_count(), 0);

    remote.set_unavailable(false);
    provider.persist_remote().await.unwrap();
    assert!(!provider.is_dirty());
    assert_eq!(remote.row_count(), 1);

    engine.close_all().await;
}

#[tokio::test]
async fn test_offline_enrollment_persists_entity_lookup() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();
    let dir = TempDir::new().unwrap();

    let engine = engine_at("alice", dir.path(), &hub, &remote, &network);
    let provider = engine.open(doc_id, "ticket-42").await.unwrap();
    provider.enable_offline().unwrap();
    insert_text(provider.doc(), "findable");
    engine.close_all().await;
    // RocksDB holds a directory lock; release it before reopening.
    drop(provider);
    drop(engine);

    let store = LocalStore::open(LocalStoreConfig::for_testing(dir.path())).unwrap();
    let record = store.find_by_entity("ticket-42").unwrap().unwrap();
    assert_eq!(record.doc_id, doc_id);
    assert!(record.offline_enabled);
    assert_eq!(store.offline_count().unwrap(), 1);
}
