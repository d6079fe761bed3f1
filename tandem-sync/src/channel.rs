//! Per-document realtime channel.
//!
//! One `DocChannel` per open document. It owns the subscription on the
//! document's named channel and runs the full sync protocol:
//!
//! ```text
//!   join ──▶ announce presence ──▶ SyncRequest(state vector)
//!                                       │
//!   edits ──▶ buffer ──▶ debounce ──▶ merge ──▶ Update (chunked if large)
//!                                       │
//!   inbound ──▶ echo filter ──▶ apply / respond / reassemble
//! ```
//!
//! Local edits are mirrored to other tabs immediately through the local
//! fan-out; only the network broadcast is debounced. When the subscription
//! errors out, the channel reconnects with exponential backoff and replays
//! the join handshake, so every reconnect is also a resync.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::EngineConfig;
use crate::debounce::Debounce;
use crate::presence::{PresenceState, PresenceTracker};
use crate::protocol::{chunk_payload, SyncMessage};
use crate::transport::{
    Inbound, LocalFanout, NetworkStatus, Outbound, RealtimeTransport, SubscriptionStatus,
};

/// Transaction origin tag for updates applied from the network or another
/// tab. The document's update observer uses it to tell remote updates from
/// local edits.
pub const REMOTE_ORIGIN: &str = "tandem:remote";

/// Channel connection state, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// Reconnect attempts exhausted.
    Failed,
}

/// Result of the join-time sync handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A peer answered our sync request; the document is caught up.
    Synced,
    /// No peer answered within the timeout. Either the channel is empty or
    /// everyone is as stale as we are; the caller decides what to do.
    Unresolved,
}

struct SyncedFlag {
    notify: Notify,
    synced: AtomicBool,
}

impl SyncedFlag {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            synced: AtomicBool::new(false),
        }
    }

    fn mark(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        self.synced.store(false, Ordering::SeqCst);
    }
}

/// Reassembles chunked payloads, keyed by group id.
///
/// Chunks may arrive in any order; duplicates are ignored. A completed group
/// is removed so a duplicate of its last chunk cannot resurrect it.
struct ChunkAssembler {
    groups: HashMap<Uuid, ChunkGroup>,
}

struct ChunkGroup {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
}

impl ChunkAssembler {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Accept one chunk; returns the reassembled payload once all parts of
    /// the group have arrived.
    fn accept(&mut self, group_id: Uuid, index: u32, total: u32, data: Vec<u8>) -> Option<Vec<u8>> {
        if total == 0 || index >= total {
            log::warn!("Dropping malformed chunk {index}/{total} in group {group_id}");
            return None;
        }
        let group = self.groups.entry(group_id).or_insert_with(|| ChunkGroup {
            total,
            parts: HashMap::new(),
        });
        if group.total != total {
            log::warn!("Chunk group {group_id} changed total; resetting");
            group.total = total;
            group.parts.clear();
        }
        group.parts.entry(index).or_insert(data);

        if group.parts.len() as u32 == group.total {
            let mut group = self
                .groups
                .remove(&group_id)
                .unwrap_or_else(|| unreachable!());
            let mut payload = Vec::new();
            for i in 0..group.total {
                if let Some(part) = group.parts.remove(&i) {
                    payload.extend_from_slice(&part);
                }
            }
            return Some(payload);
        }
        None
    }
}

/// Realtime sync channel for one document.
pub struct DocChannel {
    doc_id: Uuid,
    channel_name: String,
    device_id: Uuid,
    tab_id: Uuid,
    doc: Doc,
    config: EngineConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Current subscription's outbound sender, replaced on reconnect.
    out_tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Local updates buffered until the next debounced flush.
    pending_out: Mutex<Vec<Vec<u8>>>,
    debounce: Debounce,
    synced: SyncedFlag,
    shutdown: watch::Sender<bool>,
    presence: Arc<PresenceTracker>,
    fanout: Arc<dyn LocalFanout>,
}

impl DocChannel {
    /// Join the document's channel. Spawns the driver task (subscription,
    /// handshake, inbound processing, reconnection) and the cross-tab task.
    #[allow(clippy::too_many_arguments)]
    pub fn join(
        doc_id: Uuid,
        doc: Doc,
        device_id: Uuid,
        tab_id: Uuid,
        transport: Arc<dyn RealtimeTransport>,
        fanout: Arc<dyn LocalFanout>,
        presence: Arc<PresenceTracker>,
        network: NetworkStatus,
        config: EngineConfig,
    ) -> Arc<Self> {
        let channel_name = format!("{}:{}", config.channel_prefix, doc_id);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);

        let channel = Arc::new(Self {
            doc_id,
            channel_name,
            device_id,
            tab_id,
            doc,
            config,
            state_tx,
            out_tx: Mutex::new(None),
            pending_out: Mutex::new(Vec::new()),
            debounce: Debounce::new(),
            synced: SyncedFlag::new(),
            shutdown,
            presence,
            fanout,
        });

        tokio::spawn(channel.clone().drive(transport, network));
        tokio::spawn(channel.clone().drive_fanout());
        channel
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Buffer a local update for the next debounced broadcast and mirror it
    /// to other tabs immediately.
    ///
    /// Callable from synchronous contexts (the document's update observer).
    pub fn queue_update(self: &Arc<Self>, update: Vec<u8>) {
        self.fanout
            .publish(&self.channel_name, self.tab_id, update.clone());
        self.pending_out
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update);

        let this = self.clone();
        self.debounce
            .arm(self.config.edit_debounce, async move { this.flush().await });
    }

    /// Merge and send everything in the outbound buffer now.
    pub async fn flush(self: Arc<Self>) {
        let payloads = std::mem::take(
            &mut *self.pending_out.lock().unwrap_or_else(|e| e.into_inner()),
        );
        if payloads.is_empty() {
            return;
        }
        match merge_update_payloads(&payloads) {
            Some(merged) => {
                self.send(SyncMessage::Update {
                    device_id: self.device_id,
                    update: merged,
                })
                .await;
            }
            None => {
                // Merge failed; send the raw payloads individually.
                for update in payloads {
                    self.send(SyncMessage::Update {
                        device_id: self.device_id,
                        update,
                    })
                    .await;
                }
            }
        }
    }

    /// Broadcast an update immediately, bypassing the debounce buffer.
    pub async fn send_update_now(&self, update: Vec<u8>) {
        self.send(SyncMessage::Update {
            device_id: self.device_id,
            update,
        })
        .await;
    }

    /// Announce a refreshed local presence state (e.g. a cursor move).
    pub async fn announce_presence(&self, state: &PresenceState) {
        if let Some(tx) = self.current_sender() {
            let _ = tx.send(Outbound::Track(state.encode())).await;
        }
    }

    /// Restart the sync handshake on the current subscription: clear the
    /// synced flag and re-send our state vector. A handshake resolved on an
    /// earlier connection says nothing about what peers have now.
    pub async fn resync(&self) {
        self.synced.reset();
        let state_vector = self.doc.transact().state_vector().encode_v1();
        self.send(SyncMessage::SyncRequest {
            device_id: self.device_id,
            state_vector,
        })
        .await;
    }

    /// Wait for the join-time sync handshake to resolve.
    pub async fn wait_for_sync(&self) -> SyncOutcome {
        let mut notified = pin!(self.synced.notify.notified());
        notified.as_mut().enable();
        if self.synced.synced.load(Ordering::SeqCst) {
            return SyncOutcome::Synced;
        }
        match tokio::time::timeout(self.config.sync_timeout, notified).await {
            Ok(()) => SyncOutcome::Synced,
            Err(_) => SyncOutcome::Unresolved,
        }
    }

    /// Flush outstanding updates and leave the channel cleanly.
    pub async fn leave(self: &Arc<Self>) {
        self.debounce.cancel();
        self.clone().flush().await;
        let _ = self.shutdown.send(true);
        self.out_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.out_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Encode and send a message, chunking it when the payload exceeds the
    /// threshold. If the channel is down the payload stays buffered for the
    /// flush that follows reconnection.
    async fn send(&self, msg: SyncMessage) {
        let Some(tx) = self.current_sender() else {
            if let SyncMessage::Update { update, .. } = msg {
                self.pending_out
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(update);
            }
            return;
        };

        let encoded = match msg.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode sync message for {}: {e}", self.doc_id);
                return;
            }
        };

        if encoded.len() > self.config.chunk_threshold {
            for chunk in chunk_payload(self.device_id, &encoded, self.config.chunk_threshold) {
                let _ = tx.send(Outbound::Message(chunk)).await;
            }
        } else {
            let _ = tx.send(Outbound::Message(msg)).await;
        }
    }

    /// Apply a remote update to the document under the remote origin.
    fn apply_remote(&self, update: &[u8]) {
        match Update::decode_v1(update) {
            Ok(decoded) => {
                let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
                if let Err(e) = txn.apply_update(decoded) {
                    log::warn!("Failed to apply remote update to {}: {e}", self.doc_id);
                }
            }
            Err(e) => {
                log::warn!("Undecodable remote update for {}: {e}", self.doc_id);
            }
        }
    }

    /// Driver task: subscribe, handshake, process inbound, reconnect.
    async fn drive(
        self: Arc<Self>,
        transport: Arc<dyn RealtimeTransport>,
        network: NetworkStatus,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }

            let mut handle = transport.subscribe(&self.channel_name, self.device_id);
            *self.out_tx.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(handle.outbound.clone());

            // Wait for the subscription to leave Pending.
            while *handle.status.borrow() == SubscriptionStatus::Pending {
                if handle.status.changed().await.is_err() {
                    break;
                }
            }

            if *handle.status.borrow() == SubscriptionStatus::Subscribed {
                attempt = 0;
                self.state_tx.send_replace(ConnectionState::Connected);

                // Join handshake: presence first, then our state vector.
                let local_presence = self.presence.local_state();
                let _ = handle
                    .outbound
                    .send(Outbound::Track(local_presence.encode()))
                    .await;
                let state_vector = self.doc.transact().state_vector().encode_v1();
                self.send(SyncMessage::SyncRequest {
                    device_id: self.device_id,
                    state_vector,
                })
                .await;

                // Anything buffered while offline goes out after the window.
                if !self
                    .pending_out
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_empty()
                {
                    let this = self.clone();
                    self.debounce
                        .arm(self.config.edit_debounce, async move { this.flush().await });
                }

                let mut chunks = ChunkAssembler::new();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                self.state_tx.send_replace(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        changed = handle.status.changed() => {
                            let status = *handle.status.borrow();
                            if changed.is_err()
                                || status == SubscriptionStatus::Error
                                || status == SubscriptionStatus::Closed
                            {
                                break;
                            }
                        }
                        item = handle.inbound.recv() => {
                            match item {
                                Some(inbound) => {
                                    self.handle_inbound(&mut chunks, inbound).await;
                                }
                                None => break,
                            }
                        }
                    }
                }

                if *handle.status.borrow() == SubscriptionStatus::Closed {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
            }

            // Subscription failed or errored mid-flight: back off and retry.
            // The next subscription must re-earn the synced flag through its
            // own handshake.
            self.out_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            self.synced.reset();
            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                log::warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.channel_name,
                    self.config.max_reconnect_attempts
                );
                self.state_tx.send_replace(ConnectionState::Failed);
                return;
            }
            self.state_tx.send_replace(ConnectionState::Reconnecting);

            let delay = self.config.reconnect_base_delay * 2u32.saturating_pow(attempt - 1);
            log::debug!(
                "Reconnecting {} in {delay:?} (attempt {attempt})",
                self.channel_name
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }

            // Hold off while the device is offline; the network watcher
            // flips this back when connectivity returns.
            let mut online = network.watch();
            while !*online.borrow() && !*shutdown.borrow() {
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn handle_inbound(&self, chunks: &mut ChunkAssembler, inbound: Inbound) {
        match inbound {
            Inbound::Message(msg) => self.handle_message(chunks, msg).await,
            Inbound::PresenceJoined { device_id, state } => {
                match PresenceState::decode(&state) {
                    Some(state) => self.presence.handle_join(self.doc_id, state),
                    None => log::warn!("Undecodable presence state from {device_id}"),
                }
            }
            Inbound::PresenceLeft { device_id } => {
                self.presence.handle_leave(self.doc_id, device_id);
            }
        }
    }

    async fn handle_message(&self, chunks: &mut ChunkAssembler, msg: SyncMessage) {
        // Echo suppression comes before everything else.
        if msg.device_id() == self.device_id {
            return;
        }

        match msg {
            SyncMessage::Update { update, .. } => {
                self.apply_remote(&update);
            }
            SyncMessage::SyncRequest { state_vector, .. } => {
                match StateVector::decode_v1(&state_vector) {
                    Ok(sv) => {
                        // Answer even when the diff is empty so the requester
                        // resolves its handshake instead of timing out.
                        let diff = self.doc.transact().encode_diff_v1(&sv);
                        self.send(SyncMessage::SyncResponse {
                            device_id: self.device_id,
                            update: diff,
                        })
                        .await;
                    }
                    Err(e) => {
                        log::warn!("Undecodable state vector on {}: {e}", self.channel_name);
                    }
                }
            }
            SyncMessage::SyncResponse { update, .. } => {
                if !update.is_empty() {
                    self.apply_remote(&update);
                }
                self.synced.mark();
            }
            SyncMessage::Chunk {
                group_id,
                index,
                total,
                data,
                ..
            } => {
                if let Some(payload) = chunks.accept(group_id, index, total, data) {
                    match SyncMessage::decode(&payload) {
                        Ok(inner) => {
                            Box::pin(self.handle_message(chunks, inner)).await;
                        }
                        Err(e) => {
                            log::warn!("Reassembled chunk group {group_id} undecodable: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Cross-tab task: apply updates published by sibling tabs.
    async fn drive_fanout(self: Arc<Self>) {
        let mut rx = self.fanout.subscribe(&self.channel_name);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.source_tab != self.tab_id {
                                self.apply_remote(&frame.update);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Fanout subscriber for {} lagged by {n}", self.doc_id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }
}

impl Drop for DocChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Merge several encoded updates into one, or `None` if any fails to decode.
fn merge_update_payloads(payloads: &[Vec<u8>]) -> Option<Vec<u8>> {
    if payloads.len() == 1 {
        return Some(payloads[0].clone());
    }
    let decoded: Result<Vec<Update>, _> = payloads.iter().map(|p| Update::decode_v1(p)).collect();
    match decoded {
        Ok(updates) => Some(Update::merge_updates(updates).encode_v1()),
        Err(e) => {
            log::warn!("Failed to merge buffered updates: {e}");
            None
        }
    }
}
