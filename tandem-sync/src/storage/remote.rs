//! Remote persistence of document snapshots.
//!
//! The backing store is an injected trait object (a database API, an HTTP
//! service, or the in-memory store used by tests). Rows are keyed by the
//! application-level entity id; the document id is a column, so the latest
//! session to persist an entity owns its row. [`RemotePersistence`] wraps the
//! store with the write discipline the engine needs:
//!
//! - a dirty check: persistence is skipped when the document's state vector
//!   is unchanged since the last successful write
//! - an in-flight guard: a persistence attempt for a document already being
//!   persisted is dropped, not queued
//! - upsert semantics: select first, then update or insert

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

/// A document row in the remote store.
#[derive(Debug, Clone)]
pub struct RemoteDocRecord {
    /// Document session that produced this snapshot
    pub doc_id: Uuid,
    /// Application-level entity this document belongs to; the row key
    pub entity_id: String,
    /// Full document state (`encode_state_as_update_v1` against empty)
    pub state: Vec<u8>,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
}

/// Remote store errors.
#[derive(Debug, Clone)]
pub enum RemoteStoreError {
    /// The backing service rejected or failed the request
    RequestFailed(String),
    /// Record not found where one was required
    NotFound(String),
}

impl std::fmt::Display for RemoteStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestFailed(e) => write!(f, "Remote request failed: {e}"),
            Self::NotFound(id) => write!(f, "Remote record not found: {id}"),
        }
    }
}

impl std::error::Error for RemoteStoreError {}

/// The injected remote document store. Select and delete address the latest
/// row for an entity.
pub trait RemoteDocStore: Send + Sync {
    fn select<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RemoteDocRecord>, RemoteStoreError>>;
    fn insert(&self, record: RemoteDocRecord) -> BoxFuture<'_, Result<(), RemoteStoreError>>;
    fn update(&self, record: RemoteDocRecord) -> BoxFuture<'_, Result<(), RemoteStoreError>>;
    fn delete<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<(), RemoteStoreError>>;
}

/// Outcome of a persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The snapshot was written to the remote store.
    Persisted,
    /// Nothing changed since the last successful write.
    Clean,
    /// Another attempt for this document is already in flight; this one was
    /// dropped.
    InFlight,
}

/// Removes the doc from the in-flight set even if the write fails.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    doc_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.doc_id);
    }
}

/// Coordinates snapshot writes to the remote store.
pub struct RemotePersistence {
    store: Arc<dyn RemoteDocStore>,
    /// State vector at the last successful persist, per document.
    persisted_state: Mutex<HashMap<Uuid, Vec<u8>>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl RemotePersistence {
    pub fn new(store: Arc<dyn RemoteDocStore>) -> Self {
        Self {
            store,
            persisted_state: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether the document has changed since its last successful persist.
    pub fn is_dirty(&self, doc_id: Uuid, state_vector: &[u8]) -> bool {
        let persisted = self
            .persisted_state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        persisted.get(&doc_id).map(Vec::as_slice) != Some(state_vector)
    }

    /// Record a baseline state vector without writing, e.g. right after the
    /// document was loaded from the remote store.
    pub fn mark_clean(&self, doc_id: Uuid, state_vector: Vec<u8>) {
        self.persisted_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id, state_vector);
    }

    /// Forget all persistence bookkeeping for a document.
    pub fn forget(&self, doc_id: Uuid) {
        self.persisted_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&doc_id);
    }

    /// Persist a document snapshot if it is dirty and no attempt is in flight.
    pub async fn persist(
        &self,
        doc_id: Uuid,
        entity_id: &str,
        state: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Result<PersistOutcome, RemoteStoreError> {
        if !self.is_dirty(doc_id, &state_vector) {
            return Ok(PersistOutcome::Clean);
        }

        let _guard = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(doc_id) {
                return Ok(PersistOutcome::InFlight);
            }
            InFlightGuard {
                set: self.in_flight.clone(),
                doc_id,
            }
        };

        let record = RemoteDocRecord {
            doc_id,
            entity_id: entity_id.to_string(),
            state,
            updated_at: epoch_secs(),
        };

        match self.store.select(entity_id).await? {
            Some(_) => self.store.update(record).await?,
            None => self.store.insert(record).await?,
        }

        self.mark_clean(doc_id, state_vector);
        Ok(PersistOutcome::Persisted)
    }

    /// Fetch the latest remote snapshot for an entity, if one exists.
    pub async fn fetch(
        &self,
        entity_id: &str,
    ) -> Result<Option<RemoteDocRecord>, RemoteStoreError> {
        self.store.select(entity_id).await
    }

    /// Delete an entity's remote snapshot and forget the document's
    /// bookkeeping.
    pub async fn delete(&self, doc_id: Uuid, entity_id: &str) -> Result<(), RemoteStoreError> {
        self.store.delete(entity_id).await?;
        self.forget(doc_id);
        Ok(())
    }
}

/// In-memory remote store for tests and single-process runs. One row per
/// entity; writes replace the previous row.
#[derive(Default)]
pub struct MemoryRemoteStore {
    rows: Mutex<HashMap<String, RemoteDocRecord>>,
    /// When set, every request fails (simulated outage).
    unavailable: Mutex<bool>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a remote outage; all requests fail until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = unavailable;
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn check_available(&self) -> Result<(), RemoteStoreError> {
        if *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) {
            Err(RemoteStoreError::RequestFailed("Service unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteDocStore for MemoryRemoteStore {
    fn select<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RemoteDocRecord>, RemoteStoreError>> {
        async move {
            self.check_available()?;
            let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            Ok(rows.get(entity_id).cloned())
        }
        .boxed()
    }

    fn insert(&self, record: RemoteDocRecord) -> BoxFuture<'_, Result<(), RemoteStoreError>> {
        async move {
            self.check_available()?;
            self.rows
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(record.entity_id.clone(), record);
            Ok(())
        }
        .boxed()
    }

    fn update(&self, record: RemoteDocRecord) -> BoxFuture<'_, Result<(), RemoteStoreError>> {
        async move {
            self.check_available()?;
            let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            if !rows.contains_key(&record.entity_id) {
                return Err(RemoteStoreError::NotFound(record.entity_id.clone()));
            }
            rows.insert(record.entity_id.clone(), record);
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<(), RemoteStoreError>> {
        async move {
            self.check_available()?;
            self.rows
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(entity_id);
            Ok(())
        }
        .boxed()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
