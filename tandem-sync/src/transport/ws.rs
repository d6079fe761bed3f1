//! WebSocket implementation of the realtime transport.
//!
//! Connects to a relay at `<url>/<channel>` and bridges the transport handle
//! onto binary WebSocket frames. The relay is assumed to fan every frame out
//! to all channel subscribers (self-echo included); echo suppression stays
//! with the consumer, exactly as with the in-memory hub.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{Inbound, Outbound, RealtimeTransport, SubscriptionStatus, TransportHandle};
use crate::protocol::SyncMessage;

/// Frame format on the wire: sync messages plus presence envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireFrame {
    Sync(SyncMessage),
    PresenceJoin { device_id: Uuid, state: Vec<u8> },
    PresenceLeave { device_id: Uuid },
}

impl WireFrame {
    fn encode(&self) -> Option<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).ok()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .ok()
            .map(|(frame, _)| frame)
    }
}

/// WebSocket-backed realtime transport.
pub struct WsTransport {
    server_url: String,
    capacity: usize,
}

impl WsTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            capacity: 256,
        }
    }
}

impl RealtimeTransport for WsTransport {
    fn subscribe(&self, channel: &str, local_device: Uuid) -> TransportHandle {
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(self.capacity);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Pending);

        let url = format!("{}/{}", self.server_url, channel);

        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::connect_async(&url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::warn!("WebSocket connect to {url} failed: {e}");
                    let _ = status_tx.send(SubscriptionStatus::Error);
                    return;
                }
            };
            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let _ = status_tx.send(SubscriptionStatus::Subscribed);

            let mut tracked = false;
            loop {
                tokio::select! {
                    item = out_rx.recv() => {
                        let frame = match item {
                            Some(Outbound::Message(msg)) => WireFrame::Sync(msg),
                            Some(Outbound::Track(state)) => {
                                tracked = true;
                                WireFrame::PresenceJoin { device_id: local_device, state }
                            }
                            Some(Outbound::Untrack) => {
                                tracked = false;
                                WireFrame::PresenceLeave { device_id: local_device }
                            }
                            None => {
                                // Clean leave: withdraw presence, close the socket.
                                if tracked {
                                    if let Some(bytes) = (WireFrame::PresenceLeave {
                                        device_id: local_device,
                                    })
                                    .encode()
                                    {
                                        let _ = ws_writer.send(Message::Binary(bytes.into())).await;
                                    }
                                }
                                let _ = ws_writer.send(Message::Close(None)).await;
                                let _ = status_tx.send(SubscriptionStatus::Closed);
                                return;
                            }
                        };
                        if let Some(bytes) = frame.encode() {
                            if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                                let _ = status_tx.send(SubscriptionStatus::Error);
                                return;
                            }
                        }
                    }
                    msg = ws_reader.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let inbound = match WireFrame::decode(&bytes) {
                                    Some(WireFrame::Sync(msg)) => Some(Inbound::Message(msg)),
                                    Some(WireFrame::PresenceJoin { device_id, state }) => {
                                        (device_id != local_device)
                                            .then_some(Inbound::PresenceJoined { device_id, state })
                                    }
                                    Some(WireFrame::PresenceLeave { device_id }) => {
                                        (device_id != local_device)
                                            .then_some(Inbound::PresenceLeft { device_id })
                                    }
                                    None => {
                                        log::warn!("Undecodable frame on {url}");
                                        None
                                    }
                                };
                                if let Some(event) = inbound {
                                    if in_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = ws_writer.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = status_tx.send(SubscriptionStatus::Closed);
                                return;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error on {url}: {e}");
                                let _ = status_tx.send(SubscriptionStatus::Error);
                                return;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        TransportHandle {
            outbound: out_tx,
            inbound: in_rx,
            status: status_rx,
        }
    }
}
