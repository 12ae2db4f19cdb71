//! Shared server state.
//!
//! The peer registry and session store live together behind one mutex: the
//! cascades that span them (evict-on-re-register, unregister-removes-from-
//! all-sessions, remove-on-empty-session) are multi-step and must be
//! linearizable under tokio's multi-threaded runtime. Every public mutation
//! here takes the lock exactly once, so each message-handling step is atomic
//! with respect to all other connections. Nothing awaits while holding the
//! lock.
//!
//! The connection manager sits outside the lock: it is a delivery cache
//! keyed by peer id, allowed to briefly lag the registry.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;

use crate::connections::ConnectionManager;
use crate::protocol::{PeerInfo, SessionInfo};
use crate::registry::{Peer, PeerRegistry};
use crate::sessions::SessionStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub port: u16,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Snapshot returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub total_peers: usize,
    pub total_sessions: usize,
    pub total_participants: usize,
    pub peers: Vec<PeerInfo>,
    pub sessions: Vec<SessionInfo>,
}

/// The registries guarded by the state mutex.
#[derive(Default)]
struct SignalingCore {
    registry: PeerRegistry,
    sessions: SessionStore,
}

impl SignalingCore {
    /// Remove a peer and cascade: user index entry, membership in every
    /// session it was in (deleting sessions that become empty).
    fn unregister(&mut self, peer_id: &str) -> Option<Peer> {
        let peer = self.registry.remove(peer_id)?;
        for session_id in &peer.active_sessions {
            self.sessions.remove_participant(session_id, peer_id);
        }
        tracing::info!(
            peer_id,
            user_id = peer.user_id.as_str(),
            total_peers = self.registry.len(),
            "Peer unregistered"
        );
        Some(peer)
    }

    /// Install a peer for a user, evicting and fully unregistering any
    /// previous peer for the same `user_id` first. Returns the new peer's
    /// descriptor and the evicted peer id, if any.
    fn register(
        &mut self,
        peer_id: &str,
        user_id: &str,
        user_info: serde_json::Map<String, Value>,
    ) -> (PeerInfo, Option<String>) {
        let evicted = self.registry.peer_id_for_user(user_id).map(str::to_owned);
        if let Some(ref old_peer_id) = evicted {
            tracing::info!(
                user_id,
                old_peer_id = old_peer_id.as_str(),
                new_peer_id = peer_id,
                "Evicting previous connection for re-registering user"
            );
            self.unregister(old_peer_id);
        }

        let peer = Peer::new(peer_id, user_id, user_info);
        let info = peer.descriptor();
        self.registry.install(peer);
        tracing::info!(
            peer_id,
            user_id,
            total_peers = self.registry.len(),
            "Peer registered"
        );
        (info, evicted)
    }

    /// Put a peer into a session, keeping the `peer_id → [session_id]`
    /// index in step. Returns whether membership changed.
    fn add_peer_to_session(&mut self, peer_id: &str, session_id: &str) -> bool {
        let added = self.sessions.add_participant(session_id, peer_id);
        if added {
            self.registry.link_session(peer_id, session_id);
        }
        added
    }

    /// Create a session (idempotent) and index it for the initiator.
    fn create_session(&mut self, session_id: &str, initiator_id: &str) -> SessionInfo {
        let info = self.sessions.create(session_id, initiator_id).descriptor();
        // The initiator may be an id that never registered (side-channel
        // creation); linking is a no-op then.
        self.registry.link_session(initiator_id, session_id);
        info
    }
}

/// Cloneable handle to the shared server state.
#[derive(Clone)]
pub struct SignalState {
    core: Arc<Mutex<SignalingCore>>,
    pub connections: ConnectionManager,
    pub config: SignalConfig,
}

impl SignalState {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(SignalingCore::default())),
            connections: ConnectionManager::new(),
            config,
        }
    }

    fn core(&self) -> MutexGuard<'_, SignalingCore> {
        // A poisoned lock means a panic mid-mutation elsewhere; the registries
        // hold only droppable state, so keep serving.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Peer Registry ─────────────────────────────────────────────────────

    /// Register a peer, evicting any previous connection for the same user.
    /// The evicted peer's transport handle is removed here so the connection
    /// manager never outlives the registry.
    pub fn register_peer(
        &self,
        peer_id: &str,
        user_id: &str,
        user_info: serde_json::Map<String, Value>,
    ) -> PeerInfo {
        let (info, evicted) = self.core().register(peer_id, user_id, user_info);
        if let Some(old_peer_id) = evicted {
            // Same-connection re-register reuses the peer id; the live
            // transport handle must survive that.
            if old_peer_id != peer_id {
                self.connections.remove(&old_peer_id);
            }
        }
        info
    }

    /// Unregister a peer with the full session cascade. Returns the removed
    /// peer's descriptor for the departure broadcast; `None` if unknown.
    pub fn unregister_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.core().unregister(peer_id).map(|p| p.descriptor())
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.core().registry.get(peer_id).map(Peer::descriptor)
    }

    pub fn get_peer_by_user(&self, user_id: &str) -> Option<PeerInfo> {
        self.core().registry.get_by_user(user_id).map(Peer::descriptor)
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.core().registry.contains(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.core().registry.len()
    }

    /// All peers except `exclude`, sorted by peer id.
    pub fn available_peers(&self, exclude: Option<&str>) -> Vec<PeerInfo> {
        self.core().registry.list_available(exclude)
    }

    // ── Session Store ─────────────────────────────────────────────────────

    /// Explicit (side-channel) session creation. Idempotent.
    pub fn create_session(&self, session_id: &str, initiator_id: &str) -> SessionInfo {
        self.core().create_session(session_id, initiator_id)
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.core().sessions.get(session_id).map(|s| s.descriptor())
    }

    pub fn session_count(&self) -> usize {
        self.core().sessions.len()
    }

    // ── Signaling Steps ───────────────────────────────────────────────────
    //
    // One method per inbound signaling message, each a single atomic step.

    /// Apply an offer: ensure the session exists (initiator = sender),
    /// record the offer, and invite the recipient into the session.
    pub fn apply_offer(&self, from: &str, to: &str, session_id: &str, sdp: &str) {
        let mut core = self.core();
        if !core.sessions.contains(session_id) {
            core.create_session(session_id, from);
        }
        core.sessions.record_offer(session_id, from, sdp);
        core.add_peer_to_session(to, session_id);
    }

    /// Apply an answer: the session must already exist (from the preceding
    /// offer). The answering peer joins it if it wasn't a participant yet.
    /// Returns false, and creates nothing, for an unknown session.
    pub fn apply_answer(&self, from: &str, session_id: &str, sdp: &str) -> bool {
        let mut core = self.core();
        if !core.sessions.contains(session_id) {
            return false;
        }
        core.add_peer_to_session(from, session_id);
        core.sessions.record_answer(session_id, from, sdp)
    }

    /// Apply an ICE candidate; same session-must-exist contract as answers.
    pub fn apply_ice_candidate(&self, from: &str, session_id: &str, candidate: Value) -> bool {
        let mut core = self.core();
        if !core.sessions.contains(session_id) {
            return false;
        }
        core.add_peer_to_session(from, session_id);
        core.sessions.record_ice_candidate(session_id, from, candidate)
    }

    // ── Statistics ────────────────────────────────────────────────────────

    pub fn stats(&self) -> ServerStats {
        let core = self.core();
        ServerStats {
            total_peers: core.registry.len(),
            total_sessions: core.sessions.len(),
            total_participants: core.sessions.participant_count(),
            peers: core.registry.list_available(None),
            sessions: core.sessions.descriptors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn state() -> SignalState {
        SignalState::new(SignalConfig::default())
    }

    #[test]
    fn test_register_and_unregister_peer() {
        let state = state();

        state.register_peer("p1", "u1", Map::new());
        assert!(state.is_registered("p1"));
        assert_eq!(state.peer_count(), 1);
        assert_eq!(state.get_peer_by_user("u1").unwrap().peer_id, "p1");

        let removed = state.unregister_peer("p1").unwrap();
        assert_eq!(removed.user_id, "u1");
        assert!(!state.is_registered("p1"));
        assert!(state.get_peer_by_user("u1").is_none());
    }

    #[test]
    fn test_unregister_unknown_is_none() {
        let state = state();
        assert!(state.unregister_peer("ghost").is_none());
    }

    #[test]
    fn test_reregistration_evicts_previous_peer() {
        let state = state();
        let (tx_old, _rx_old) = tokio::sync::mpsc::unbounded_channel();
        state.connections.insert("p1", tx_old);

        state.register_peer("p1", "u1", Map::new());
        state.apply_offer("p1", "p2", "s1", "sdp");
        assert!(state.session_info("s1").is_some());

        // Same user registers from a new connection.
        state.register_peer("p9", "u1", Map::new());

        assert!(!state.is_registered("p1"));
        assert_eq!(state.get_peer_by_user("u1").unwrap().peer_id, "p9");
        assert_eq!(state.peer_count(), 1);
        // Old connection handle removed along with the registry entry.
        assert!(!state.connections.contains("p1"));
        // p1 left s1; p2 remains a participant so the session survives.
        let session = state.session_info("s1").unwrap();
        assert_eq!(session.participants, vec!["p2"]);
    }

    #[test]
    fn test_reregistration_alone_in_session_deletes_it() {
        let state = state();
        state.register_peer("p1", "u1", Map::new());
        state.create_session("s1", "p1");

        state.register_peer("p9", "u1", Map::new());
        assert!(state.session_info("s1").is_none());
    }

    #[test]
    fn test_same_connection_reregister_keeps_transport() {
        let state = state();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.connections.insert("p1", tx);

        state.register_peer("p1", "u1", Map::new());
        state.register_peer("p1", "u1", Map::new());

        assert!(state.is_registered("p1"));
        assert!(state.connections.contains("p1"));
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_at_most_one_peer_per_user() {
        let state = state();
        for i in 0..5 {
            state.register_peer(&format!("p{}", i), "u1", Map::new());
            assert_eq!(state.peer_count(), 1);
        }
        assert_eq!(state.get_peer_by_user("u1").unwrap().peer_id, "p4");
    }

    #[test]
    fn test_unregister_cascades_into_sessions() {
        let state = state();
        state.register_peer("a", "u1", Map::new());
        state.register_peer("b", "u2", Map::new());
        state.apply_offer("a", "b", "s1", "offer");

        // b disconnects mid-session: s1 keeps a, so it persists.
        state.unregister_peer("b");
        let session = state.session_info("s1").unwrap();
        assert_eq!(session.participants, vec!["a"]);

        // a disconnects too: s1 is now gone, never observed empty.
        state.unregister_peer("a");
        assert!(state.session_info("s1").is_none());
    }

    #[test]
    fn test_apply_offer_creates_session_with_both_peers() {
        let state = state();
        state.register_peer("a", "u1", Map::new());
        state.register_peer("b", "u2", Map::new());

        state.apply_offer("a", "b", "s1", "v=0...");

        let session = state.session_info("s1").unwrap();
        assert_eq!(session.initiator_id, "a");
        assert_eq!(session.participants, vec!["a", "b"]);

        // Index kept in step on both peers.
        assert_eq!(state.get_peer("a").unwrap().active_sessions, vec!["s1"]);
        assert_eq!(state.get_peer("b").unwrap().active_sessions, vec!["s1"]);
    }

    #[test]
    fn test_apply_offer_into_existing_session() {
        let state = state();
        state.register_peer("a", "u1", Map::new());
        state.register_peer("b", "u2", Map::new());
        state.create_session("s1", "a");

        state.apply_offer("a", "b", "s1", "v=0...");

        let session = state.session_info("s1").unwrap();
        assert_eq!(session.initiator_id, "a");
        assert_eq!(session.participants, vec!["a", "b"]);
    }

    #[test]
    fn test_apply_answer_requires_session() {
        let state = state();
        state.register_peer("a", "u1", Map::new());

        assert!(!state.apply_answer("a", "nonexistent", "sdp"));
        // No dangling session created as a side effect.
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn test_apply_ice_candidate_requires_session() {
        let state = state();
        assert!(!state.apply_ice_candidate("a", "nonexistent", serde_json::json!({})));
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn test_explicit_create_session_is_idempotent() {
        let state = state();
        state.register_peer("a", "u1", Map::new());

        let first = state.create_session("s1", "a");
        state.apply_offer("a", "b", "s1", "offer");
        let second = state.create_session("s1", "a");

        assert_eq!(state.session_count(), 1);
        assert_eq!(first.session_id, second.session_id);
        // Exchange state survived the second create.
        assert_eq!(second.participants, vec!["a", "b"]);
    }

    #[test]
    fn test_available_peers_excludes_requester() {
        let state = state();
        state.register_peer("a", "u1", Map::new());
        state.register_peer("b", "u2", Map::new());

        let peers = state.available_peers(Some("a"));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "b");
    }

    #[test]
    fn test_stats_snapshot() {
        let state = state();
        state.register_peer("a", "u1", Map::new());
        state.register_peer("b", "u2", Map::new());
        state.apply_offer("a", "b", "s1", "offer");
        state.create_session("s2", "a");

        let stats = state.stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_participants, 3); // {a,b} + {a}
        assert_eq!(stats.peers.len(), 2);
        assert_eq!(stats.sessions.len(), 2);
        assert_eq!(stats.sessions[0].session_id, "s1");
    }
}
