//! Collaborator presence tracking.
//!
//! Tracks who is viewing/editing each document and notifies registered
//! listeners on change. Entries are keyed `user_id:device_id`: the same user
//! on two devices appears twice, while tabs on one device collapse into a
//! single entry. Colors are a pure hash of the user id into a fixed palette,
//! so a user keeps the same color across sessions and devices without any
//! coordination.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

/// Fixed cursor palette; assignment is `hash(user_id) % len`.
pub const COLOR_PALETTE: [&str; 8] = [
    "#E57373", "#64B5F6", "#81C784", "#FFD54F", "#BA68C8", "#4DB6AC", "#F06292", "#A1887F",
];

/// Deterministic palette color for a user id (FNV-1a).
pub fn color_for_user(user_id: &str) -> &'static str {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    COLOR_PALETTE[(hash % COLOR_PALETTE.len() as u64) as usize]
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The local user's identity, supplied by the application.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// One collaborator's presence on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub color: String,
    /// Opaque cursor payload (application-defined encoding).
    pub cursor: Option<Vec<u8>>,
    /// Opaque selection payload.
    pub selection: Option<Vec<u8>>,
    pub device_id: Uuid,
    /// Milliseconds since epoch of the last activity.
    pub last_active_at: u64,
}

impl PresenceState {
    pub fn new(identity: &LocalIdentity, device_id: Uuid) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            avatar_url: identity.avatar_url.clone(),
            color: color_for_user(&identity.user_id).to_string(),
            cursor: None,
            selection: None,
            device_id,
            last_active_at: epoch_millis(),
        }
    }

    /// Presence map key: same user+device across tabs collapses to one entry.
    pub fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.device_id)
    }

    /// Encode as the opaque transport presence payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    /// Decode from the opaque transport presence payload.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .ok()
            .map(|(state, _)| state)
    }
}

type ChangeListener = Box<dyn Fn(&[PresenceState]) + Send + Sync>;

#[derive(Default)]
struct DocPresence {
    collaborators: HashMap<String, PresenceState>,
    listeners: HashMap<u64, ChangeListener>,
    last_cursor_accepted: Option<Instant>,
}

/// Id of a registered change listener, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Process-wide presence tracker, one entry set per open document.
pub struct PresenceTracker {
    docs: Mutex<HashMap<Uuid, DocPresence>>,
    local_device: Uuid,
    identity: LocalIdentity,
    cursor_interval: Duration,
    next_listener: AtomicU64,
}

impl PresenceTracker {
    pub fn new(local_device: Uuid, identity: LocalIdentity, cursor_interval: Duration) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            local_device,
            identity,
            cursor_interval,
            next_listener: AtomicU64::new(1),
        }
    }

    /// The presence state announced for the local user on join.
    pub fn local_state(&self) -> PresenceState {
        PresenceState::new(&self.identity, self.local_device)
    }

    /// Apply a remote collaborator join/update.
    pub fn handle_join(&self, doc_id: Uuid, mut state: PresenceState) {
        state.last_active_at = epoch_millis();
        {
            let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
            let doc = docs.entry(doc_id).or_default();
            doc.collaborators.insert(state.key(), state);
        }
        self.notify(doc_id);
    }

    /// Apply a remote collaborator leave (all entries for the device).
    pub fn handle_leave(&self, doc_id: Uuid, device_id: Uuid) {
        let removed = {
            let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
            match docs.get_mut(&doc_id) {
                Some(doc) => {
                    let before = doc.collaborators.len();
                    doc.collaborators.retain(|_, s| s.device_id != device_id);
                    doc.collaborators.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.notify(doc_id);
        }
    }

    /// Rate-limited local cursor update.
    ///
    /// Returns the refreshed local presence state to broadcast, or `None` when
    /// the update falls inside the rate-limit window (dropped, not queued —
    /// the next accepted update carries the latest position anyway).
    pub fn update_local_cursor(
        &self,
        doc_id: Uuid,
        cursor: Vec<u8>,
        selection: Option<Vec<u8>>,
    ) -> Option<PresenceState> {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let doc = docs.entry(doc_id).or_default();

        if let Some(last) = doc.last_cursor_accepted {
            if last.elapsed() < self.cursor_interval {
                return None;
            }
        }
        doc.last_cursor_accepted = Some(Instant::now());

        let mut state = self.local_state();
        state.cursor = Some(cursor);
        state.selection = selection;
        Some(state)
    }

    /// All collaborators on a document, excluding the local user.
    pub fn collaborators(&self, doc_id: Uuid) -> Vec<PresenceState> {
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.get(&doc_id)
            .map(|doc| {
                doc.collaborators
                    .values()
                    .filter(|s| s.user_id != self.identity.user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register a change listener; fired with the full collaborator list.
    pub fn on_change<F>(&self, doc_id: Uuid, listener: F) -> ListenerId
    where
        F: Fn(&[PresenceState]) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.entry(doc_id)
            .or_default()
            .listeners
            .insert(id, Box::new(listener));
        ListenerId(id)
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, doc_id: Uuid, id: ListenerId) {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(doc) = docs.get_mut(&doc_id) {
            doc.listeners.remove(&id.0);
        }
    }

    /// Drop all state for a closed document.
    pub fn clear_doc(&self, doc_id: Uuid) {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.remove(&doc_id);
    }

    /// Invoke listeners with a snapshot of the collaborator list.
    ///
    /// A panicking listener is logged and skipped; it never blocks delivery
    /// to the others or corrupts tracker state.
    fn notify(&self, doc_id: Uuid) {
        let snapshot = self.collaborators(doc_id);
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(doc) = docs.get(&doc_id) else {
            return;
        };
        for (id, listener) in &doc.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                log::warn!("Presence listener {id} for doc {doc_id} panicked");
            }
        }
    }
}
