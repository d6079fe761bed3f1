//! Per-document lifecycle orchestration.
//!
//! A `DocProvider` owns one open document end to end: loading state (local
//! snapshot + pending replay, then remote, then empty), wiring the update
//! observer, joining the realtime channel, and running the two persistence
//! loops (debounced local snapshot save, periodic remote persist).
//!
//! ```text
//!             ┌──────────── local edit ────────────┐
//!             ▼                                    │
//!   observer: dirty ─▶ pending log ─▶ channel ─▶ save debounce
//!             ▲
//!             └──────────── remote update (origin-tagged, not re-broadcast)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::channel::{ConnectionState, DocChannel, SyncOutcome, REMOTE_ORIGIN};
use crate::config::EngineConfig;
use crate::debounce::Debounce;
use crate::engine::EngineError;
use crate::presence::PresenceTracker;
use crate::storage::{LocalStore, PersistOutcome, RemotePersistence, SnapshotRecord};
use crate::transport::{LocalFanout, NetworkStatus, RealtimeTransport};

/// Shared dependencies for every provider the engine opens.
pub struct SyncContext {
    pub device_id: Uuid,
    pub tab_id: Uuid,
    pub transport: Arc<dyn RealtimeTransport>,
    pub fanout: Arc<dyn LocalFanout>,
    pub presence: Arc<PresenceTracker>,
    pub network: NetworkStatus,
    pub local: Arc<LocalStore>,
    pub remote: Arc<RemotePersistence>,
    pub config: EngineConfig,
}

/// One open collaborative document.
pub struct DocProvider {
    doc_id: Uuid,
    entity_id: String,
    doc: Doc,
    ctx: Arc<SyncContext>,
    channel: Mutex<Arc<DocChannel>>,
    dirty: AtomicBool,
    offline_enabled: AtomicBool,
    /// Local snapshot save, reset-on-event: fires after the last edit.
    save_debounce: Debounce,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    update_sub: Mutex<Option<yrs::Subscription>>,
    closed: AtomicBool,
}

impl DocProvider {
    /// Open a document: load state, join the channel, run the join sync, and
    /// start the persistence loops.
    pub async fn open(
        doc_id: Uuid,
        entity_id: String,
        ctx: Arc<SyncContext>,
    ) -> Result<Arc<Self>, EngineError> {
        let doc = Doc::new();
        let mut offline_enabled = false;
        let mut had_state = false;

        // Load priority: local snapshot + pending replay, then remote.
        if let Some(record) = ctx.local.get_snapshot(doc_id)? {
            offline_enabled = record.offline_enabled;
            apply_state(&doc, &record.state);
            for pending in ctx.local.pending_updates(doc_id)? {
                apply_state(&doc, &pending.update);
            }
            had_state = true;
            log::debug!("Loaded {doc_id} from local snapshot");
        } else if ctx.network.is_online() {
            match ctx.remote.fetch(&entity_id).await {
                Ok(Some(row)) => {
                    apply_state(&doc, &row.state);
                    let sv = doc.transact().state_vector().encode_v1();
                    ctx.remote.mark_clean(doc_id, sv);
                    had_state = true;
                    log::debug!("Loaded {doc_id} from remote store");
                }
                Ok(None) => {}
                Err(e) => {
                    // A fresh doc is still editable; remote sync catches up later.
                    log::warn!("Remote load of {doc_id} failed: {e}");
                }
            }
        }

        let channel = DocChannel::join(
            doc_id,
            doc.clone(),
            ctx.device_id,
            ctx.tab_id,
            ctx.transport.clone(),
            ctx.fanout.clone(),
            ctx.presence.clone(),
            ctx.network.clone(),
            ctx.config.clone(),
        );

        let provider = Arc::new(Self {
            doc_id,
            entity_id,
            doc,
            ctx: ctx.clone(),
            channel: Mutex::new(channel),
            dirty: AtomicBool::new(false),
            offline_enabled: AtomicBool::new(offline_enabled),
            save_debounce: Debounce::new(),
            persist_task: Mutex::new(None),
            update_sub: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = provider.wire_observer() {
            // The driver task is already running; stop it before bailing.
            provider.current_channel().leave().await;
            return Err(e);
        }

        if ctx.network.is_online() {
            let outcome = provider.current_channel().wait_for_sync().await;
            if outcome == SyncOutcome::Unresolved && !had_state {
                // Nobody answered and we had nothing locally; the remote
                // store is the last resort.
                if let Ok(Some(row)) = ctx.remote.fetch(&provider.entity_id).await {
                    provider.apply_remote_state(&row.state);
                }
            }
        }

        provider.start_persist_timer();
        Ok(provider)
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The shared CRDT document. Edits through any clone of this handle flow
    /// through the provider's observer.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_offline_enabled(&self) -> bool {
        self.offline_enabled.load(Ordering::SeqCst)
    }

    /// Observe the channel's connection state.
    pub fn connection_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.current_channel().state()
    }

    fn current_channel(&self) -> Arc<DocChannel> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wire the update observer: local edits are logged, broadcast, and
    /// scheduled for saving; remote-origin updates only mark dirty and
    /// refresh the save window.
    fn wire_observer(self: &Arc<Self>) -> Result<(), EngineError> {
        let weak = Arc::downgrade(self);
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                let Some(provider) = weak.upgrade() else {
                    return;
                };
                if provider.closed.load(Ordering::SeqCst) {
                    return;
                }
                provider.dirty.store(true, Ordering::SeqCst);

                let remote = txn.origin() == Some(&REMOTE_ORIGIN.into());
                if !remote {
                    if provider.is_offline_enabled() {
                        // Best effort: a full log is recovered from the next
                        // snapshot save anyway.
                        if let Err(e) = provider
                            .ctx
                            .local
                            .append_pending(provider.doc_id, &event.update)
                        {
                            log::warn!(
                                "Pending append failed for {}: {e}",
                                provider.doc_id
                            );
                        }
                    }
                    provider.current_channel().queue_update(event.update.clone());
                }

                if provider.is_offline_enabled() {
                    provider.schedule_local_save();
                }
            })
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        *self.update_sub.lock().unwrap_or_else(|e| e.into_inner()) = Some(sub);
        Ok(())
    }

    fn schedule_local_save(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.save_debounce
            .reset(self.ctx.config.local_save_debounce, async move {
                if let Some(provider) = weak.upgrade() {
                    if let Err(e) = provider.save_local() {
                        log::warn!("Local save of {} failed: {e}", provider.doc_id);
                    }
                }
            });
    }

    fn start_persist_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.ctx.config.remote_persist_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(provider) = weak.upgrade() else {
                    return;
                };
                if provider.closed.load(Ordering::SeqCst) {
                    return;
                }
                if provider.is_dirty() && provider.ctx.network.is_online() {
                    if let Err(e) = provider.persist_remote().await {
                        log::warn!("Periodic persist of {} failed: {e}", provider.doc_id);
                    }
                }
            }
        });
        *self.persist_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn encode_state(&self) -> (Vec<u8>, Vec<u8>) {
        let txn = self.doc.transact();
        (
            txn.encode_state_as_update_v1(&StateVector::default()),
            txn.state_vector().encode_v1(),
        )
    }

    fn apply_remote_state(&self, state: &[u8]) {
        apply_state(&self.doc, state);
    }

    /// Rate-limited cursor/selection broadcast. Updates inside the rate
    /// window are dropped.
    pub async fn update_cursor(&self, cursor: Vec<u8>, selection: Option<Vec<u8>>) {
        if let Some(state) = self
            .ctx
            .presence
            .update_local_cursor(self.doc_id, cursor, selection)
        {
            self.current_channel().announce_presence(&state).await;
        }
    }

    /// Persist the document to the remote store. On success the pending log
    /// is cleared and the snapshot's persist timestamp is bumped.
    pub async fn persist_remote(&self) -> Result<PersistOutcome, EngineError> {
        let (state, state_vector) = self.encode_state();
        let outcome = self
            .ctx
            .remote
            .persist(self.doc_id, &self.entity_id, state, state_vector)
            .await?;
        match outcome {
            PersistOutcome::Persisted => {
                self.dirty.store(false, Ordering::SeqCst);
                self.ctx.local.clear_pending(self.doc_id)?;
                if self.is_offline_enabled() {
                    if let Some(mut record) = self.ctx.local.get_snapshot(self.doc_id)? {
                        record.last_persisted_at = Some(epoch_secs());
                        self.ctx.local.put_snapshot(&record)?;
                    }
                }
                log::debug!("Persisted {} to remote store", self.doc_id);
            }
            PersistOutcome::Clean => {
                self.dirty.store(false, Ordering::SeqCst);
            }
            PersistOutcome::InFlight => {}
        }
        Ok(outcome)
    }

    /// Save a full local snapshot and clear the now-superseded pending log.
    pub fn save_local(&self) -> Result<(), EngineError> {
        let (state, state_vector) = self.encode_state();
        let last_persisted_at = self
            .ctx
            .local
            .get_snapshot(self.doc_id)?
            .and_then(|r| r.last_persisted_at);
        let mut record = SnapshotRecord::new(
            self.doc_id,
            self.entity_id.clone(),
            state,
            state_vector,
        );
        record.offline_enabled = true;
        record.last_persisted_at = last_persisted_at;
        self.ctx.local.put_snapshot(&record)?;
        self.ctx.local.clear_pending(self.doc_id)?;
        Ok(())
    }

    /// Enroll the document for offline editing. Fails without side effects
    /// when the configured limit is reached.
    pub fn enable_offline(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_offline_enabled() {
            return Ok(());
        }
        let count = self.ctx.local.offline_count()?;
        let limit = self.ctx.config.max_offline_documents;
        if count >= limit {
            return Err(EngineError::OfflineLimitExceeded { limit });
        }
        self.save_local()?;
        self.offline_enabled.store(true, Ordering::SeqCst);
        log::info!("Offline editing enabled for {}", self.doc_id);
        Ok(())
    }

    /// Withdraw the document from offline editing, dropping its snapshot and
    /// pending log. The open document itself is unaffected.
    pub fn disable_offline(&self) -> Result<(), EngineError> {
        self.offline_enabled.store(false, Ordering::SeqCst);
        self.save_debounce.cancel();
        self.ctx.local.delete_snapshot(self.doc_id)?;
        log::info!("Offline editing disabled for {}", self.doc_id);
        Ok(())
    }

    /// Offline→online transition: replay the pending log, rejoin the channel
    /// if it gave up, resync with peers (remote fetch as fallback), broadcast
    /// the merged state once, and force a persist.
    pub async fn handle_online(self: &Arc<Self>) -> Result<(), EngineError> {
        for pending in self.ctx.local.pending_updates(self.doc_id)? {
            self.apply_remote_state(&pending.update);
        }

        let (channel, reused) = {
            let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
            let state = *slot.state().borrow();
            if state == ConnectionState::Failed || state == ConnectionState::Disconnected {
                // The old channel exhausted its reconnects; start fresh.
                let fresh = DocChannel::join(
                    self.doc_id,
                    self.doc.clone(),
                    self.ctx.device_id,
                    self.ctx.tab_id,
                    self.ctx.transport.clone(),
                    self.ctx.fanout.clone(),
                    self.ctx.presence.clone(),
                    self.ctx.network.clone(),
                    self.ctx.config.clone(),
                );
                *slot = fresh.clone();
                (fresh, false)
            } else {
                (slot.clone(), true)
            }
        };

        // A reused channel still carries the old handshake's resolution;
        // restart it so the wait below reflects peers as they are now.
        if reused {
            channel.resync().await;
        }
        if channel.wait_for_sync().await == SyncOutcome::Unresolved {
            if let Ok(Some(row)) = self.ctx.remote.fetch(&self.entity_id).await {
                self.apply_remote_state(&row.state);
            }
        }

        // One full-state broadcast so peers that were ahead of our pending
        // log still converge.
        let (state, _) = self.encode_state();
        channel.send_update_now(state).await;

        self.dirty.store(true, Ordering::SeqCst);
        self.persist_remote().await?;
        Ok(())
    }

    /// Close the document: stop timers, final saves, leave the channel.
    pub async fn close(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.save_debounce.cancel();
        if let Some(handle) = self
            .persist_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let mut first_err: Option<EngineError> = None;
        if self.is_offline_enabled() {
            if let Err(e) = self.save_local() {
                log::warn!("Final local save of {} failed: {e}", self.doc_id);
                first_err.get_or_insert(e);
            }
        }
        if self.is_dirty() && self.ctx.network.is_online() {
            if let Err(e) = self.persist_remote().await {
                log::warn!("Final persist of {} failed: {e}", self.doc_id);
                first_err.get_or_insert(e);
            }
        }

        self.current_channel().leave().await;
        self.ctx.presence.clear_doc(self.doc_id);
        self.update_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear the provider down without final saves. Used when initialization
    /// fails partway and on engine shutdown paths that must not block.
    pub async fn destroy(self: &Arc<Self>) {
        self.closed.store(true, Ordering::SeqCst);
        self.save_debounce.cancel();
        if let Some(handle) = self
            .persist_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.current_channel().leave().await;
        self.ctx.presence.clear_doc(self.doc_id);
        self.update_sub
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Apply an encoded full state or update under the remote origin so the
/// observer does not re-broadcast or re-log it.
fn apply_state(doc: &Doc, state: &[u8]) {
    if state.is_empty() {
        return;
    }
    match Update::decode_v1(state) {
        Ok(update) => {
            let mut txn = doc.transact_mut_with(REMOTE_ORIGIN);
            if let Err(e) = txn.apply_update(update) {
                log::warn!("Failed to apply stored state: {e}");
            }
        }
        Err(e) => log::warn!("Undecodable stored state: {e}"),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
