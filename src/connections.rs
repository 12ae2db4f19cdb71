//! Live transport handles.
//!
//! Maps `peer_id → sender channel` for currently reachable connections.
//! This is a delivery cache, not a source of truth: it may briefly lag the
//! peer registry around registration and teardown, and it is never consulted
//! for identity decisions. A failed send drops the handle; unregistering the
//! peer itself is the connection handler's job.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// A connected client's sender channel. The connection handler's sender
/// task drains the other end onto the WebSocket.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Clone, Default)]
pub struct ConnectionManager {
    transports: Arc<DashMap<String, ClientSender>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire up a transport handle for a peer. Replaces any previous handle
    /// under the same id.
    pub fn insert(&self, peer_id: &str, sender: ClientSender) {
        self.transports.insert(peer_id.to_string(), sender);
    }

    /// Drop a peer's transport handle, if present.
    pub fn remove(&self, peer_id: &str) {
        self.transports.remove(peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.transports.contains_key(peer_id)
    }

    /// Deliver a message to one peer. On failure the peer is treated as
    /// disconnected and its handle removed; the caller sees `false` and no
    /// error.
    pub fn send_to(&self, peer_id: &str, message: ServerMessage) -> bool {
        let delivered = match self.transports.get(peer_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => return false,
        };
        if !delivered {
            tracing::debug!(peer_id, "Transport send failed, dropping connection handle");
            self.transports.remove(peer_id);
        }
        delivered
    }

    /// Deliver a relay envelope to the recipient named in its `to` field.
    pub fn forward(&self, message: ServerMessage) -> bool {
        let Some(to) = message.target().map(str::to_owned) else {
            tracing::warn!("Refusing to forward a message without a recipient");
            return false;
        };
        self.send_to(&to, message)
    }

    /// Best-effort fan-out to every connected peer except `exclude`.
    /// Partial failures are logged and cleaned up without aborting the
    /// broadcast.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        let mut dead: Vec<String> = Vec::new();
        for entry in self.transports.iter() {
            if exclude == Some(entry.key().as_str()) {
                continue;
            }
            if entry.value().send(message.clone()).is_err() {
                tracing::debug!(peer_id = entry.key().as_str(), "Broadcast send failed");
                dead.push(entry.key().clone());
            }
        }
        // Removal happens after iteration: removing a key while holding an
        // iterator guard on the same shard would deadlock.
        for peer_id in dead {
            self.transports.remove(&peer_id);
        }
    }
}
