//! Call session lifecycle and the SDP/ICE artifacts exchanged within them.
//!
//! A session never exists with zero participants: removing the last
//! participant deletes it in the same call. Stored artifacts make the
//! relay idempotent under client retransmission and let a reconnecting
//! participant inspect session state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::SessionInfo;

/// A recorded SDP body (offer or answer) from one peer.
#[derive(Debug, Clone, Serialize)]
pub struct SdpRecord {
    pub sdp: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-peer offer/answer slots within a session. Re-sending overwrites;
/// renegotiation offers are not distinguished from first offers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SdpExchange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SdpRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SdpRecord>,
}

/// A recorded ICE candidate from one peer. Candidates accumulate in
/// receipt order.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub candidate: Value,
    pub timestamp: DateTime<Utc>,
}

/// One call-establishment context shared by one or more peers.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: String,
    pub initiator_id: String,
    pub participants: HashSet<String>,
    pub sdp_exchanges: HashMap<String, SdpExchange>,
    pub ice_candidates: HashMap<String, Vec<CandidateRecord>>,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    fn new(session_id: &str, initiator_id: &str) -> Self {
        let mut participants = HashSet::new();
        participants.insert(initiator_id.to_string());
        let mut ice_candidates = HashMap::new();
        ice_candidates.insert(initiator_id.to_string(), Vec::new());

        Self {
            session_id: session_id.to_string(),
            initiator_id: initiator_id.to_string(),
            participants,
            sdp_exchanges: HashMap::new(),
            ice_candidates,
            created_at: Utc::now(),
        }
    }

    fn add_participant(&mut self, peer_id: &str) -> bool {
        if self.participants.contains(peer_id) {
            return false;
        }
        self.participants.insert(peer_id.to_string());
        self.ice_candidates.insert(peer_id.to_string(), Vec::new());
        true
    }

    fn remove_participant(&mut self, peer_id: &str) -> bool {
        if !self.participants.remove(peer_id) {
            return false;
        }
        self.sdp_exchanges.remove(peer_id);
        self.ice_candidates.remove(peer_id);
        true
    }

    /// Snapshot for the inspection endpoints; participants sorted for
    /// deterministic output.
    pub fn descriptor(&self) -> SessionInfo {
        let mut participants: Vec<String> = self.participants.iter().cloned().collect();
        participants.sort();
        SessionInfo {
            session_id: self.session_id.clone(),
            initiator_id: self.initiator_id.clone(),
            participant_count: participants.len(),
            participants,
            created_at: self.created_at,
        }
    }
}

/// Session table. Like the peer registry, this is a plain data structure
/// guarded by the shared state layer's mutex.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, CallSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with the initiator as sole participant. Idempotent:
    /// an existing session is returned unchanged, so duplicate-offer races
    /// and client retries never reset exchange state.
    pub fn create(&mut self, session_id: &str, initiator_id: &str) -> &CallSession {
        if !self.sessions.contains_key(session_id) {
            tracing::info!(
                session_id,
                initiator_id,
                "Creating call session"
            );
            self.sessions.insert(
                session_id.to_string(),
                CallSession::new(session_id, initiator_id),
            );
        }
        &self.sessions[session_id]
    }

    pub fn get(&self, session_id: &str) -> Option<&CallSession> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total participants across all sessions.
    pub fn participant_count(&self) -> usize {
        self.sessions.values().map(|s| s.participants.len()).sum()
    }

    /// Sorted descriptors for the stats dump.
    pub fn descriptors(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.sessions.values().map(CallSession::descriptor).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Add a participant. Returns whether membership changed; false when the
    /// session does not exist; the caller decides whether to create it.
    pub fn add_participant(&mut self, session_id: &str, peer_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let added = session.add_participant(peer_id);
        if added {
            tracing::debug!(session_id, peer_id, "Participant added to session");
        }
        added
    }

    /// Remove a participant and its recorded artifacts. Deletes the session
    /// in the same call when it becomes empty, so an empty session is never
    /// observable.
    pub fn remove_participant(&mut self, session_id: &str, peer_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let removed = session.remove_participant(peer_id);
        if removed && session.participants.is_empty() {
            self.sessions.remove(session_id);
            tracing::info!(session_id, "Removed empty call session");
        }
        removed
    }

    /// Record an SDP offer. Overwrites any prior offer from the same peer.
    /// Returns false if the session does not exist.
    pub fn record_offer(&mut self, session_id: &str, peer_id: &str, sdp: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session
            .sdp_exchanges
            .entry(peer_id.to_string())
            .or_default()
            .offer = Some(SdpRecord {
            sdp: sdp.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Record an SDP answer. Overwrites any prior answer from the same peer.
    /// Returns false if the session does not exist.
    pub fn record_answer(&mut self, session_id: &str, peer_id: &str, sdp: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session
            .sdp_exchanges
            .entry(peer_id.to_string())
            .or_default()
            .answer = Some(SdpRecord {
            sdp: sdp.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Append an ICE candidate for a peer, preserving receipt order.
    /// Returns false if the session does not exist.
    pub fn record_ice_candidate(&mut self, session_id: &str, peer_id: &str, candidate: Value) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session
            .ice_candidates
            .entry(peer_id.to_string())
            .or_default()
            .push(CandidateRecord {
                candidate,
                timestamp: Utc::now(),
            });
        true
    }
}
