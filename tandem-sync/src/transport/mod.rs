//! Consumed transport interfaces.
//!
//! The engine does not build pub/sub infrastructure; it consumes three
//! external signals behind small seams:
//!
//! - [`RealtimeTransport`] — named-channel pub/sub with presence join/leave
//!   events and a subscription status transition.
//! - [`LocalFanout`] — same-device, cross-tab message passing with no network
//!   involved.
//! - [`NetworkStatus`] — a boolean observable for offline/online transitions.
//!
//! Two `RealtimeTransport` implementations ship: an in-process hub
//! ([`memory::MemoryHub`]) and a WebSocket client ([`ws::WsTransport`]).

pub mod memory;
pub mod ws;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::protocol::SyncMessage;

/// Status of a channel subscription, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscribe requested, no acknowledgement yet.
    Pending,
    /// Subscribed; messages flow.
    Subscribed,
    /// The transport failed; the subscription is dead.
    Error,
    /// Cleanly closed.
    Closed,
}

/// Items a subscriber sends into its channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A sync protocol message for all other subscribers.
    Message(SyncMessage),
    /// Announce presence with an opaque state payload.
    Track(Vec<u8>),
    /// Withdraw presence.
    Untrack,
}

/// Items a subscriber receives from its channel.
///
/// Message frames may include the subscriber's own sends (explicit self-echo);
/// echo suppression happens at the consumer by device id.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(SyncMessage),
    PresenceJoined { device_id: Uuid, state: Vec<u8> },
    PresenceLeft { device_id: Uuid },
}

/// Handle returned by [`RealtimeTransport::subscribe`].
pub struct TransportHandle {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
    pub status: watch::Receiver<SubscriptionStatus>,
}

/// Realtime publish/subscribe transport (consumed).
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to a named channel. The handle's status watch reports the
    /// subscribed/error/closed transition; dropping the outbound sender
    /// leaves the channel.
    fn subscribe(&self, channel: &str, local_device: Uuid) -> TransportHandle;
}

/// One frame on the cross-tab fan-out: a raw update plus its source tab.
#[derive(Debug, Clone)]
pub struct FanoutFrame {
    pub source_tab: Uuid,
    pub update: Arc<Vec<u8>>,
}

/// Cross-tab local fan-out (consumed, same device only).
pub trait LocalFanout: Send + Sync {
    fn publish(&self, channel: &str, source_tab: Uuid, update: Vec<u8>);
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<FanoutFrame>;
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    ConnectFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "Transport connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "Transport connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A boolean network-status observable the provider watches for
/// offline→online transitions.
#[derive(Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, rx) = watch::channel(online);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(online);
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_status_transitions() {
        let status = NetworkStatus::new(false);
        assert!(!status.is_online());

        let mut rx = status.watch();
        status.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(status.is_online());
    }
}
