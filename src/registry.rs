//! Peer identity bookkeeping.
//!
//! Owns the peer table and the `user_id → peer_id` index. At most one live
//! peer exists per user: the eviction cascade for re-registration lives in
//! the shared state layer, which also owns session membership.
//!
//! Lookup misses are `Option`/`bool` returns, never errors; disconnect
//! races are normal flow here.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::protocol::PeerInfo;

/// One connected, identified client.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub user_info: serde_json::Map<String, Value>,
    /// Sessions this peer currently participates in. This is the
    /// `peer_id → [session_id]` index; it is adjusted on every session
    /// membership change.
    pub active_sessions: HashSet<String>,
}

impl Peer {
    pub fn new(peer_id: &str, user_id: &str, user_info: serde_json::Map<String, Value>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            user_id: user_id.to_string(),
            connected_at: Utc::now(),
            user_info,
            active_sessions: HashSet::new(),
        }
    }

    /// Snapshot for the wire. Session ids are sorted so roster messages
    /// are deterministic.
    pub fn descriptor(&self) -> PeerInfo {
        let mut active_sessions: Vec<String> = self.active_sessions.iter().cloned().collect();
        active_sessions.sort();
        PeerInfo {
            peer_id: self.peer_id.clone(),
            user_id: self.user_id.clone(),
            connected_at: self.connected_at,
            active_sessions,
            user_info: self.user_info.clone(),
        }
    }
}

/// Peer table plus the user index. Not synchronized itself; the shared
/// state layer guards it with the registry mutex.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    user_to_peer: HashMap<String, String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a peer. The caller must have evicted any previous peer for
    /// the same user first; the user index is overwritten unconditionally.
    pub fn install(&mut self, peer: Peer) {
        self.user_to_peer
            .insert(peer.user_id.clone(), peer.peer_id.clone());
        self.peers.insert(peer.peer_id.clone(), peer);
    }

    /// Remove a peer and its user index entry. Returns the removed peer so
    /// the caller can cascade session removal and notifications.
    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        let peer = self.peers.remove(peer_id)?;
        // Only drop the index entry if it still points at this peer; it may
        // already have been repointed by a re-registration.
        if self.user_to_peer.get(&peer.user_id).map(String::as_str) == Some(peer_id) {
            self.user_to_peer.remove(&peer.user_id);
        }
        Some(peer)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<&Peer> {
        self.peers.get(self.user_to_peer.get(user_id)?)
    }

    pub fn peer_id_for_user(&self, user_id: &str) -> Option<&str> {
        self.user_to_peer.get(user_id).map(String::as_str)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All peers except `exclude`, sorted by peer id for deterministic
    /// replies.
    pub fn list_available(&self, exclude: Option<&str>) -> Vec<PeerInfo> {
        let mut available: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|peer| exclude != Some(peer.peer_id.as_str()))
            .map(Peer::descriptor)
            .collect();
        available.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        available
    }

    /// Record that `peer_id` joined `session_id`. No-op for unknown peers
    /// (sessions may reference ids that never registered).
    pub fn link_session(&mut self, peer_id: &str, session_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.active_sessions.insert(session_id.to_string());
        }
    }

    /// Record that `peer_id` left `session_id`.
    pub fn unlink_session(&mut self, peer_id: &str, session_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.active_sessions.remove(session_id);
        }
    }
}
