//! Engine: the owned registry of open documents and the public surface.
//!
//! One `SyncEngine` per process (or per test). It owns the provider registry,
//! guarantees idempotent opens, and watches the injected network status to
//! drive reconnection for every open document when connectivity returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::presence::{ListenerId, LocalIdentity, PresenceState, PresenceTracker};
use crate::provider::{DocProvider, SyncContext};
use crate::storage::{
    LocalStore, LocalStoreError, RemoteDocStore, RemotePersistence, RemoteStoreError,
    SnapshotRecord,
};
use crate::transport::{LocalFanout, NetworkStatus, RealtimeTransport};

/// Engine-level errors.
#[derive(Debug)]
pub enum EngineError {
    /// Local store failure
    Storage(LocalStoreError),
    /// Remote store failure
    Remote(RemoteStoreError),
    /// Offline enrollment would exceed the configured limit
    OfflineLimitExceeded { limit: usize },
    /// No state reachable (not open, no local snapshot, remote unreachable)
    OfflineStateUnavailable(Uuid),
    /// Operation requires the document to be open
    DocumentNotOpen(Uuid),
    /// Unexpected internal failure
    Internal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "Storage error: {e}"),
            Self::Remote(e) => write!(f, "Remote error: {e}"),
            Self::OfflineLimitExceeded { limit } => {
                write!(f, "Offline document limit reached ({limit})")
            }
            Self::OfflineStateUnavailable(id) => {
                write!(f, "No state available to enable offline for {id}")
            }
            Self::DocumentNotOpen(id) => write!(f, "Document not open: {id}"),
            Self::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LocalStoreError> for EngineError {
    fn from(e: LocalStoreError) -> Self {
        EngineError::Storage(e)
    }
}

impl From<RemoteStoreError> for EngineError {
    fn from(e: RemoteStoreError) -> Self {
        EngineError::Remote(e)
    }
}

/// Handle returned by [`SyncEngine::on_collaborators_change`].
pub struct CollaboratorSubscription {
    presence: Arc<PresenceTracker>,
    doc_id: Uuid,
    id: ListenerId,
}

impl CollaboratorSubscription {
    pub fn unsubscribe(self) {
        self.presence.unsubscribe(self.doc_id, self.id);
    }
}

/// The document sync engine.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    providers: Arc<RwLock<HashMap<Uuid, Arc<DocProvider>>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine around injected infrastructure. Generates fresh
    /// device and tab ids for this instance.
    pub fn new(
        identity: LocalIdentity,
        transport: Arc<dyn RealtimeTransport>,
        fanout: Arc<dyn LocalFanout>,
        local: Arc<LocalStore>,
        remote_store: Arc<dyn RemoteDocStore>,
        network: NetworkStatus,
        config: EngineConfig,
    ) -> Self {
        let device_id = Uuid::new_v4();
        let presence = Arc::new(PresenceTracker::new(
            device_id,
            identity,
            config.cursor_update_interval,
        ));
        let ctx = Arc::new(SyncContext {
            device_id,
            tab_id: Uuid::new_v4(),
            transport,
            fanout,
            presence,
            network: network.clone(),
            local,
            remote: Arc::new(RemotePersistence::new(remote_store)),
            config,
        });

        let providers = Arc::new(RwLock::new(HashMap::new()));
        let engine = Self {
            ctx,
            providers: providers.clone(),
            watcher: Mutex::new(None),
        };
        engine.start_network_watcher(network);
        engine
    }

    /// Spawn the watcher that reconnects every open document when the
    /// device comes back online.
    fn start_network_watcher(&self, network: NetworkStatus) {
        let providers = Arc::downgrade(&self.providers);
        let mut rx = network.watch();
        let mut was_online = *rx.borrow();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                let came_online = online && !was_online;
                was_online = online;
                if !came_online {
                    continue;
                }
                let Some(providers) = providers.upgrade() else {
                    return;
                };
                let open: Vec<Arc<DocProvider>> =
                    providers.read().await.values().cloned().collect();
                log::info!("Network restored; reconnecting {} documents", open.len());
                for provider in open {
                    tokio::spawn(async move {
                        if let Err(e) = provider.handle_online().await {
                            log::warn!("Reconnect of {} failed: {e}", provider.doc_id());
                        }
                    });
                }
            }
        });
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Open a document. Idempotent: concurrent and repeated opens of the
    /// same document share one provider.
    pub async fn open(
        &self,
        doc_id: Uuid,
        entity_id: impl Into<String>,
    ) -> Result<Arc<DocProvider>, EngineError> {
        if let Some(existing) = self.providers.read().await.get(&doc_id) {
            return Ok(existing.clone());
        }

        // The write lock serializes racing opens of the same document.
        let mut providers = self.providers.write().await;
        if let Some(existing) = providers.get(&doc_id) {
            return Ok(existing.clone());
        }
        let provider = DocProvider::open(doc_id, entity_id.into(), self.ctx.clone()).await?;
        providers.insert(doc_id, provider.clone());
        log::info!("Opened document {doc_id}");
        Ok(provider)
    }

    /// Whether a document is currently open.
    pub async fn is_open(&self, doc_id: Uuid) -> bool {
        self.providers.read().await.contains_key(&doc_id)
    }

    /// Number of open documents.
    pub async fn open_count(&self) -> usize {
        self.providers.read().await.len()
    }

    /// Close a document: final saves, channel leave, registry removal.
    pub async fn close(&self, doc_id: Uuid) -> Result<(), EngineError> {
        let provider = self
            .providers
            .write()
            .await
            .remove(&doc_id)
            .ok_or(EngineError::DocumentNotOpen(doc_id))?;
        provider.close().await?;
        log::info!("Closed document {doc_id}");
        Ok(())
    }

    /// Close every open document concurrently. Individual failures are
    /// logged; the rest still close.
    pub async fn close_all(&self) {
        let drained: Vec<(Uuid, Arc<DocProvider>)> =
            self.providers.write().await.drain().collect();
        let teardowns = drained.into_iter().map(|(doc_id, provider)| async move {
            if let Err(e) = provider.close().await {
                log::warn!("Closing {doc_id} failed: {e}");
            }
        });
        futures_util::future::join_all(teardowns).await;
    }

    /// Broadcast a cursor/selection update for an open document.
    pub async fn update_cursor(
        &self,
        doc_id: Uuid,
        cursor: Vec<u8>,
        selection: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let provider = self
            .providers
            .read()
            .await
            .get(&doc_id)
            .cloned()
            .ok_or(EngineError::DocumentNotOpen(doc_id))?;
        provider.update_cursor(cursor, selection).await;
        Ok(())
    }

    /// Current collaborators on a document, excluding the local user.
    pub async fn get_collaborators(&self, doc_id: Uuid) -> Vec<PresenceState> {
        self.ctx.presence.collaborators(doc_id)
    }

    /// Register a collaborator-change listener; returns an unsubscribe
    /// handle.
    pub fn on_collaborators_change<F>(&self, doc_id: Uuid, listener: F) -> CollaboratorSubscription
    where
        F: Fn(&[PresenceState]) + Send + Sync + 'static,
    {
        let id = self.ctx.presence.on_change(doc_id, listener);
        CollaboratorSubscription {
            presence: self.ctx.presence.clone(),
            doc_id,
            id,
        }
    }

    /// Enroll a document for offline editing. Works for open documents (live
    /// save) and closed ones (local snapshot flip, or remote fetch). Fails
    /// without side effects when no state is reachable or the limit is hit.
    pub async fn enable_offline(
        &self,
        doc_id: Uuid,
        entity_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        if let Some(provider) = self.providers.read().await.get(&doc_id).cloned() {
            return provider.enable_offline();
        }

        let limit = self.ctx.config.max_offline_documents;
        if self.ctx.local.offline_count()? >= limit {
            return Err(EngineError::OfflineLimitExceeded { limit });
        }

        if let Some(mut record) = self.ctx.local.get_snapshot(doc_id)? {
            record.offline_enabled = true;
            self.ctx.local.put_snapshot(&record)?;
            return Ok(());
        }

        if self.ctx.network.is_online() {
            let entity_id = entity_id.into();
            if let Some(row) = self.ctx.remote.fetch(&entity_id).await? {
                let state_vector = state_vector_of(&row.state);
                let mut record = SnapshotRecord::new(doc_id, entity_id, row.state, state_vector);
                record.offline_enabled = true;
                self.ctx.local.put_snapshot(&record)?;
                return Ok(());
            }
        }

        Err(EngineError::OfflineStateUnavailable(doc_id))
    }

    /// Withdraw a document from offline editing.
    pub async fn disable_offline(&self, doc_id: Uuid) -> Result<(), EngineError> {
        if let Some(provider) = self.providers.read().await.get(&doc_id).cloned() {
            return provider.disable_offline();
        }
        self.ctx.local.delete_snapshot(doc_id)?;
        Ok(())
    }

    /// Persist every dirty open document; failures are isolated per doc.
    pub async fn persist_all_dirty(&self) {
        let open: Vec<Arc<DocProvider>> =
            self.providers.read().await.values().cloned().collect();
        for provider in open {
            if provider.is_dirty() {
                if let Err(e) = provider.persist_remote().await {
                    log::warn!("Persist of {} failed: {e}", provider.doc_id());
                }
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// State vector of an encoded full state, computed by replaying it into a
/// scratch doc.
fn state_vector_of(state: &[u8]) -> Vec<u8> {
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, ReadTxn, Transact, Update};

    let doc = Doc::new();
    if let Ok(update) = Update::decode_v1(state) {
        let mut txn = doc.transact_mut();
        if let Err(e) = txn.apply_update(update) {
            log::warn!("Failed to replay state for state vector: {e}");
        }
    }
    let sv = doc.transact().state_vector().encode_v1();
    sv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStoreConfig, MemoryRemoteStore};
    use crate::transport::memory::{MemoryFanout, MemoryHub};
    use std::time::Duration;
    use tempfile::TempDir;
    use yrs::{GetString, Text, Transact};

    fn make_engine(
        user: &str,
        hub: &Arc<MemoryHub>,
        remote: &Arc<MemoryRemoteStore>,
        network: &NetworkStatus,
    ) -> (SyncEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(
            LocalIdentity {
                user_id: user.to_string(),
                name: user.to_string(),
                avatar_url: None,
            },
            hub.clone() as Arc<dyn RealtimeTransport>,
            Arc::new(MemoryFanout::with_defaults()) as Arc<dyn LocalFanout>,
            Arc::new(LocalStore::open(LocalStoreConfig::for_testing(dir.path())).unwrap()),
            remote.clone() as Arc<dyn RemoteDocStore>,
            network.clone(),
            EngineConfig::for_testing(),
        );
        (engine, dir)
    }

    fn insert_text(doc: &yrs::Doc, text: &str) {
        let root = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        let len = root.get_string(&txn).len() as u32;
        root.insert(&mut txn, len, text);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
        let doc_id = Uuid::new_v4();

        let first = engine.open(doc_id, "note").await.unwrap();
        let second = engine.open(doc_id, "note").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.open_count().await, 1);
        engine.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_provider() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
        let engine = Arc::new(engine);
        let doc_id = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(
                async move { engine.open(doc_id, "note").await },
            ));
        }
        let opened: Vec<Arc<DocProvider>> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        for provider in &opened[1..] {
            assert!(Arc::ptr_eq(&opened[0], provider));
        }
        assert_eq!(engine.open_count().await, 1);
        engine.close_all().await;
    }

    #[tokio::test]
    async fn test_close_removes_from_registry() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
        let doc_id = Uuid::new_v4();

        engine.open(doc_id, "note").await.unwrap();
        assert!(engine.is_open(doc_id).await);

        engine.close(doc_id).await.unwrap();
        assert!(!engine.is_open(doc_id).await);

        match engine.close(doc_id).await {
            Err(EngineError::DocumentNotOpen(id)) => assert_eq!(id, doc_id),
            other => panic!("expected not-open error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collaborators_visible_across_engines() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine_a, _da) = make_engine("alice", &hub, &remote, &network);
        let (engine_b, _db) = make_engine("bob", &hub, &remote, &network);
        let doc_id = Uuid::new_v4();

        engine_a.open(doc_id, "note").await.unwrap();
        engine_b.open(doc_id, "note").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen_by_a = engine_a.get_collaborators(doc_id).await;
        assert_eq!(seen_by_a.len(), 1);
        assert_eq!(seen_by_a[0].user_id, "bob");

        let seen_by_b = engine_b.get_collaborators(doc_id).await;
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].user_id, "alice");

        engine_a.close_all().await;
        engine_b.close_all().await;
    }

    #[tokio::test]
    async fn test_enable_offline_for_closed_doc_via_remote() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let doc_id = Uuid::new_v4();

        // Someone else persisted the document earlier.
        {
            let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
            let provider = engine.open(doc_id, "note").await.unwrap();
            insert_text(provider.doc(), "content");
            tokio::time::sleep(Duration::from_millis(100)).await;
            provider.persist_remote().await.unwrap();
            engine.close_all().await;
        }

        let (engine, _dir) = make_engine("bob", &hub, &remote, &network);
        engine.enable_offline(doc_id, "note").await.unwrap();

        // The snapshot landed locally without the doc being open.
        assert!(!engine.is_open(doc_id).await);
        let provider = engine.open(doc_id, "note").await.unwrap();
        assert!(provider.is_offline_enabled());
        engine.close_all().await;
    }

    #[tokio::test]
    async fn test_enable_offline_unreachable_state_fails() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(false);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);

        match engine.enable_offline(Uuid::new_v4(), "ghost").await {
            Err(EngineError::OfflineStateUnavailable(_)) => {}
            other => panic!("expected unavailable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_network_watcher_survives_transitions() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);
        let doc_id = Uuid::new_v4();

        let provider = engine.open(doc_id, "note").await.unwrap();
        insert_text(provider.doc(), "offline edit");

        network.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        network.set_online(true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The watcher-triggered reconnect persisted the dirty document.
        assert_eq!(remote.row_count(), 1);
        engine.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all_tolerates_remote_outage() {
        let hub = Arc::new(MemoryHub::with_defaults());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkStatus::new(true);
        let (engine, _dir) = make_engine("alice", &hub, &remote, &network);

        for i in 0..3 {
            let provider = engine.open(Uuid::new_v4(), format!("note-{i}")).await.unwrap();
            insert_text(provider.doc(), "x");
        }
        remote.set_unavailable(true);

        // Final persists fail but every provider still closes.
        engine.close_all().await;
        assert_eq!(engine.open_count().await, 0);
    }
}
