//! Engine configuration.
//!
//! One config struct for the whole subsystem: debounce windows, chunking
//! threshold, reconnect backoff, sync timeout, and offline-enrollment limits.

use std::time::Duration;

/// Configuration for the document sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Channel-name prefix; peers rendezvous on `"<prefix>:<doc_id>"`.
    pub channel_prefix: String,
    /// Quiet period before buffered local updates are merged and broadcast.
    pub edit_debounce: Duration,
    /// Quiet period before a full local snapshot save (offline-enabled docs).
    pub local_save_debounce: Duration,
    /// Interval of the periodic remote-persistence timer.
    pub remote_persist_interval: Duration,
    /// How long the join-time sync protocol waits for a peer response.
    pub sync_timeout: Duration,
    /// Encoded payloads above this size are split into chunk messages.
    pub chunk_threshold: usize,
    /// Base delay for reconnect backoff (`base * 2^(attempt-1)`).
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
    /// Maximum number of offline-enabled documents.
    pub max_offline_documents: usize,
    /// Minimum interval between accepted cursor updates per document.
    pub cursor_update_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "tandem:doc".to_string(),
            edit_debounce: Duration::from_millis(300),
            local_save_debounce: Duration::from_millis(1000),
            remote_persist_interval: Duration::from_secs(15),
            sync_timeout: Duration::from_secs(3),
            chunk_threshold: 64 * 1024,
            reconnect_base_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            max_offline_documents: 10,
            cursor_update_interval: Duration::from_millis(33),
        }
    }
}

impl EngineConfig {
    /// Config for testing: short timers so tests settle quickly.
    pub fn for_testing() -> Self {
        Self {
            edit_debounce: Duration::from_millis(20),
            local_save_debounce: Duration::from_millis(40),
            remote_persist_interval: Duration::from_millis(200),
            sync_timeout: Duration::from_millis(250),
            chunk_threshold: 1024,
            reconnect_base_delay: Duration::from_millis(10),
            max_reconnect_attempts: 3,
            max_offline_documents: 3,
            cursor_update_interval: Duration::from_millis(25),
            ..Self::default()
        }
    }
}
