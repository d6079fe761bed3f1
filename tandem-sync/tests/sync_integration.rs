//! End-to-end sync tests: two engines on a shared in-memory hub, real
//! RocksDB stores, real join/broadcast/persistence flows.

use std::path::Path;
use std::sync::Arc;
use tandem_sync::{
    EngineConfig, LocalIdentity, LocalStore, LocalStoreConfig, MemoryFanout, MemoryHub,
    MemoryRemoteStore, NetworkStatus, RealtimeTransport, SyncEngine, SyncMessage,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Duration};
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
async fn test_two_engines_converge_both_directions() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();

    let (engine_a, _da) = make_engine("alice", &hub, &remote, &network);
    let (engine_b, _db) = make_engine("bob", &hub, &remote, &network);

    let a = engine_a.open(doc_id, "note").await.unwrap();
    let b = engine_b.open(doc_id, "note").await.unwrap();

    insert_text(a.doc(), "from-alice ");
    settle().await;
    insert_text(b.doc(), "from-bob");
    settle().await;

    assert_eq!(read_text(a.doc()), read_text(b.doc()));
    assert!(read_text(a.doc()).contains("from-alice"));
    assert!(read_text(a.doc()).contains("from-bob"));

    engine_a.close_all().await;
    engine_b.close_all().await;
}

#[tokio::test]
async fn test_late_joiner_receives_existing_content() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();

    let (engine_a, _da) = make_engine("alice", &hub, &remote, &network);
    let a = engine_a.open(doc_id, "note").await.unwrap();
    insert_text(a.doc(), "written before bob arrived");
    settle().await;

    let (engine_b, _db) = make_engine("bob", &hub, &remote, &network);
    let b = engine_b.open(doc_id, "note").await.unwrap();

    assert_eq!(read_text(b.doc()), "written before bob arrived");

    engine_a.close_all().await;
    engine_b.close_all().await;
}

#[tokio::test]
async fn test_edit_burst_coalesces_to_one_broadcast() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();
    let config = EngineConfig::for_testing();

    // A raw spy subscription on the doc's channel counts wire messages.
    let mut spy = hub.subscribe(&format!("{}:{doc_id}", config.channel_prefix), Uuid::new_v4());

    let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
    let provider = engine.open(doc_id, "note").await.unwrap();

    for i in 0..10 {
        insert_text(provider.doc(), &format!("edit{i} "));
    }
    settle().await;

    let mut update_frames = 0;
    while let Ok(Some(inbound)) = timeout(Duration::from_millis(50), spy.inbound.recv()).await {
        if let tandem_sync::transport::Inbound::Message(SyncMessage::Update { .. }) = inbound {
            update_frames += 1;
        }
    }
    assert_eq!(update_frames, 1, "burst must merge into a single broadcast");

    engine.close_all().await;
}

#[tokio::test]
async fn test_oversized_payload_travels_as_chunks() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();
    let config = EngineConfig::for_testing();

    let (engine_a, _da) = make_engine("alice", &hub, &remote, &network);
    let (engine_b, _db) = make_engine("bob", &hub, &remote, &network);
    let a = engine_a.open(doc_id, "note").await.unwrap();
    let b = engine_b.open(doc_id, "note").await.unwrap();

    let mut spy = hub.subscribe(&format!("{}:{doc_id}", config.channel_prefix), Uuid::new_v4());

    // Far beyond the 1KiB testing threshold.
    let big = "y".repeat(32 * 1024);
    insert_text(a.doc(), &big);
    settle().await;

    let mut chunk_frames = 0;
    let mut oversized_plain = 0;
    while let Ok(Some(inbound)) = timeout(Duration::from_millis(50), spy.inbound.recv()).await {
        match inbound {
            tandem_sync::transport::Inbound::Message(SyncMessage::Chunk { data, total, .. }) => {
                assert!(data.len() <= config.chunk_threshold);
                assert!(total > 1);
                chunk_frames += 1;
            }
            tandem_sync::transport::Inbound::Message(SyncMessage::Update { update, .. }) => {
                if update.len() > config.chunk_threshold {
                    oversized_plain += 1;
                }
            }
            _ => {}
        }
    }
    assert!(chunk_frames > 1, "large payload must be split into chunks");
    assert_eq!(oversized_plain, 0, "no oversized frame may bypass chunking");
    assert_eq!(read_text(b.doc()).len(), big.len());

    engine_a.close_all().await;
    engine_b.close_all().await;
}

#[tokio::test]
async fn test_duplicate_update_application_is_idempotent() {
    let hub = Arc::new(MemoryHub::with_defaults());
    let remote = Arc::new(MemoryRemoteStore::new());
    let network = NetworkStatus::new(true);
    let doc_id = Uuid::new_v4();

    let (engine_a, _da) = make_engine("alice", &hub, &remote, &network);
    let (engine_b, _db) = make_engine("bob", &hub, &remote, &network);
    let a = engine_a.open(doc_id, "note").await.unwrap();
    let b = engine_b.open(doc_id, "note").await.unwrap();

    insert_text(a.doc(), "exactly once");
    settle().await;

    // Persisting and re-opening replays the same operations again; the
    // CRDT must not duplicate them.
    a.persist_remote().await.unwrap();
    b.handle_online().await.unwrap();
    settle().await;

    assert_eq!(read_text(b.doc()), "exactly once");

    engine_a.close_all().await;
    engine_b.close_all().await;
}
