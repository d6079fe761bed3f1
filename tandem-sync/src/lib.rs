//! # tandem-sync — Local-first collaborative document engine
//!
//! Keeps CRDT documents synchronized across devices and tabs with realtime
//! broadcast, durable local storage, and periodic remote persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   open/close    ┌─────────────┐   per document
//! │ SyncEngine │ ───────────────► │ DocProvider │ ──────────────┐
//! │ (registry) │                  │ (lifecycle) │               │
//! └─────┬──────┘                  └──────┬──────┘               │
//!       │ network watch                  │ observe_update       │
//!       ▼                                ▼                      ▼
//! ┌────────────┐                  ┌─────────────┐        ┌────────────┐
//! │ Presence   │                  │ DocChannel  │        │ Storage    │
//! │ Tracker    │ ◄──────────────── │ (debounce,  │        │ local +    │
//! │            │   join/leave     │  sync, chunk)│        │ remote     │
//! └────────────┘                  └──────┬──────┘        └────────────┘
//!                                        │
//!                              ┌─────────┴─────────┐
//!                              │ RealtimeTransport │
//!                              │ (hub / WebSocket) │
//!                              └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`channel`] — Per-document channel: debounced broadcast, join sync,
//!   chunking, backoff reconnect
//! - [`presence`] — Collaborator presence with rate-limited cursors
//! - [`provider`] — Document lifecycle: load, observe, save, persist
//! - [`engine`] — Owned registry and public surface
//! - [`transport`] — Consumed transport seams + in-memory and WebSocket impls
//! - [`storage`] — RocksDB local store and remote persistence manager

pub mod channel;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use channel::{ConnectionState, DocChannel, SyncOutcome};
pub use config::EngineConfig;
pub use engine::{CollaboratorSubscription, EngineError, SyncEngine};
pub use presence::{LocalIdentity, PresenceState, PresenceTracker};
pub use protocol::{ProtocolError, SyncMessage};
pub use provider::{DocProvider, SyncContext};
pub use storage::{
    LocalStore, LocalStoreConfig, LocalStoreError, MemoryRemoteStore, PersistOutcome,
    RemoteDocRecord, RemoteDocStore, RemotePersistence, RemoteStoreError, SnapshotRecord,
};
pub use transport::{
    memory::{MemoryFanout, MemoryHub},
    ws::WsTransport,
    LocalFanout, NetworkStatus, RealtimeTransport, SubscriptionStatus, TransportError,
};
