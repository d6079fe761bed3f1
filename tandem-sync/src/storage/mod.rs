//! Durable storage: local snapshots/pending queue and remote persistence.

pub mod local;
pub mod remote;

pub use local::{LocalStore, LocalStoreConfig, LocalStoreError, PendingUpdate, SnapshotRecord};
pub use remote::{
    MemoryRemoteStore, PersistOutcome, RemoteDocRecord, RemoteDocStore, RemotePersistence,
    RemoteStoreError,
};
