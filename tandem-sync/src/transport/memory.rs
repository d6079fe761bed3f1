//! In-process transport hub.
//!
//! Named channels fan out over `tokio::sync::broadcast`: every subscriber's
//! bridge task forwards hub frames into its inbound queue, so a send reaches
//! all subscribers (including the sender, which suppresses its own echo by
//! device id). Presence is tracked per channel so late joiners immediately
//! see who is already there.
//!
//! Used by tests and by same-process peers; the cross-tab fan-out lives here
//! too since it is the same mechanism minus the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::{
    FanoutFrame, Inbound, LocalFanout, Outbound, RealtimeTransport, SubscriptionStatus,
    TransportHandle,
};
use crate::protocol::SyncMessage;

/// A frame on the hub's internal broadcast bus.
#[derive(Debug, Clone)]
enum HubFrame {
    Message(Arc<SyncMessage>),
    Joined { device_id: Uuid, state: Arc<Vec<u8>> },
    Left { device_id: Uuid },
    /// Simulated transport failure; every subscriber drops into `Error`.
    Sever,
}

struct HubChannel {
    bus: broadcast::Sender<HubFrame>,
    /// Presence state of currently-tracked devices.
    presences: Arc<Mutex<HashMap<Uuid, Vec<u8>>>>,
}

/// In-memory realtime transport.
pub struct MemoryHub {
    channels: Mutex<HashMap<String, Arc<HubChannel>>>,
    capacity: usize,
}

impl MemoryHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(256)
    }

    fn channel(&self, name: &str) -> Arc<HubChannel> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| {
                let (bus, _) = broadcast::channel(self.capacity);
                Arc::new(HubChannel {
                    bus,
                    presences: Arc::new(Mutex::new(HashMap::new())),
                })
            })
            .clone()
    }

    /// Simulate a transport failure on a channel: every current subscriber
    /// transitions to `Error` and stops receiving.
    pub fn sever(&self, name: &str) {
        let channel = self.channel(name);
        let _ = channel.bus.send(HubFrame::Sever);
    }

    /// Number of live channels (for tests).
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl RealtimeTransport for MemoryHub {
    fn subscribe(&self, channel: &str, local_device: Uuid) -> TransportHandle {
        let core = self.channel(channel);
        let mut bus_rx = core.bus.subscribe();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(self.capacity);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Pending);

        let presences = core.presences.clone();
        let bus = core.bus.clone();

        tokio::spawn(async move {
            let _ = status_tx.send(SubscriptionStatus::Subscribed);

            // Replay presences that were tracked before we joined.
            let existing: Vec<(Uuid, Vec<u8>)> = {
                let guard = presences.lock().unwrap_or_else(|e| e.into_inner());
                guard.iter().map(|(k, v)| (*k, v.clone())).collect()
            };
            for (device_id, state) in existing {
                if device_id != local_device
                    && in_tx
                        .send(Inbound::PresenceJoined { device_id, state })
                        .await
                        .is_err()
                {
                    return;
                }
            }

            let mut tracked = false;
            loop {
                tokio::select! {
                    item = out_rx.recv() => {
                        match item {
                            Some(Outbound::Message(msg)) => {
                                let _ = bus.send(HubFrame::Message(Arc::new(msg)));
                            }
                            Some(Outbound::Track(state)) => {
                                tracked = true;
                                presences
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .insert(local_device, state.clone());
                                let _ = bus.send(HubFrame::Joined {
                                    device_id: local_device,
                                    state: Arc::new(state),
                                });
                            }
                            Some(Outbound::Untrack) => {
                                tracked = false;
                                presences
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .remove(&local_device);
                                let _ = bus.send(HubFrame::Left { device_id: local_device });
                            }
                            None => {
                                // Subscriber dropped its sender: clean leave.
                                if tracked {
                                    presences
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .remove(&local_device);
                                    let _ = bus.send(HubFrame::Left { device_id: local_device });
                                }
                                let _ = status_tx.send(SubscriptionStatus::Closed);
                                return;
                            }
                        }
                    }
                    frame = bus_rx.recv() => {
                        match frame {
                            Ok(HubFrame::Message(msg)) => {
                                let _ = in_tx.send(Inbound::Message((*msg).clone())).await;
                            }
                            Ok(HubFrame::Joined { device_id, state }) => {
                                if device_id != local_device {
                                    let _ = in_tx
                                        .send(Inbound::PresenceJoined {
                                            device_id,
                                            state: (*state).clone(),
                                        })
                                        .await;
                                }
                            }
                            Ok(HubFrame::Left { device_id }) => {
                                if device_id != local_device {
                                    let _ = in_tx
                                        .send(Inbound::PresenceLeft { device_id })
                                        .await;
                                }
                            }
                            Ok(HubFrame::Sever) => {
                                if tracked {
                                    presences
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .remove(&local_device);
                                }
                                let _ = status_tx.send(SubscriptionStatus::Error);
                                return;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Hub subscriber {local_device} lagged by {n} frames");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                let _ = status_tx.send(SubscriptionStatus::Closed);
                                return;
                            }
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

/// In-memory cross-tab fan-out: broadcast per channel name, device-local.
pub struct MemoryFanout {
    channels: Mutex<HashMap<String, broadcast::Sender<FanoutFrame>>>,
    capacity: usize,
}

impl MemoryFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(256)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<FanoutFrame> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl LocalFanout for MemoryFanout {
    fn publish(&self, channel: &str, source_tab: Uuid, update: Vec<u8>) {
        let _ = self.sender(channel).send(FanoutFrame {
            source_tab,
            update: Arc::new(update),
        });
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<FanoutFrame> {
        self.sender(channel).subscribe()
    }
}
