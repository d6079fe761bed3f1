//! Binary wire protocol for document synchronization.
//!
//! Messages are a tagged union serialized with bincode. Every variant carries
//! the sending device's id so receivers can discard their own echoes before
//! any other processing.
//!
//! ```text
//! Update       — merged CRDT delta
//! SyncRequest  — joiner's state vector
//! SyncResponse — the diff the requester is missing
//! Chunk        — one slice of an oversized payload (group_id, index, total)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level sync protocol message.
///
/// The serde variant tag is the wire discriminant; variant order is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// A CRDT update delta (possibly the merge of several local edits).
    Update {
        device_id: Uuid,
        update: Vec<u8>,
    },
    /// Join-time sync request carrying the requester's encoded state vector.
    SyncRequest {
        device_id: Uuid,
        state_vector: Vec<u8>,
    },
    /// Reply to a sync request: the diff the requester is missing.
    SyncResponse {
        device_id: Uuid,
        update: Vec<u8>,
    },
    /// One slice of a payload that exceeded the chunking threshold.
    Chunk {
        device_id: Uuid,
        group_id: Uuid,
        index: u32,
        total: u32,
        data: Vec<u8>,
    },
}

impl SyncMessage {
    /// The id of the device that sent this message.
    pub fn device_id(&self) -> Uuid {
        match self {
            SyncMessage::Update { device_id, .. }
            | SyncMessage::SyncRequest { device_id, .. }
            | SyncMessage::SyncResponse { device_id, .. }
            | SyncMessage::Chunk { device_id, .. } => *device_id,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Split an oversized payload into ordered chunk messages sharing a group id.
///
/// `chunk_size` is the maximum data length per chunk; the last chunk carries
/// the remainder. Returns at least one chunk for a non-empty payload.
pub fn chunk_payload(device_id: Uuid, payload: &[u8], chunk_size: usize) -> Vec<SyncMessage> {
    let group_id = Uuid::new_v4();
    let total = payload.len().div_ceil(chunk_size).max(1) as u32;
    payload
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, data)| SyncMessage::Chunk {
            device_id,
            group_id,
            index: index as u32,
            total,
            data: data.to_vec(),
        })
        .collect()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
