//! Signaling protocol message definitions.
//!
//! The relay speaks JSON-over-WebSocket. SDP bodies and ICE candidates are
//! opaque to the relay, which stores and forwards them without parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → Server ───────────────────────────────────────────────────────────

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind this connection to a user identity.
    /// Must be sent before any signaling message.
    Register {
        user_id: String,
        /// Free-form display metadata (name, role, avatar, ...).
        #[serde(default)]
        user_info: serde_json::Map<String, Value>,
    },

    /// Request the list of peers available for calling.
    GetPeers,

    /// Send an SDP offer to another peer within a session.
    /// Creates the session implicitly if it doesn't exist yet.
    Offer {
        to: String,
        session_id: String,
        sdp: String,
    },

    /// Send an SDP answer back to the offering peer.
    /// The session must already exist.
    Answer {
        to: String,
        session_id: String,
        sdp: String,
    },

    /// Relay an ICE candidate to another participant in the session.
    IceCandidate {
        to: String,
        session_id: String,
        candidate: Value,
    },

    /// Application-level keepalive.
    Ping,
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent immediately after the transport is accepted, before registration.
    ConnectionAck {
        peer_id: String,
        message: String,
    },

    /// Current roster, sent right after the connection ack.
    AvailablePeers {
        peers: Vec<PeerInfo>,
    },

    /// Acknowledgement of a successful `register`.
    Register {
        success: bool,
        peer_id: String,
        user_id: String,
    },

    /// Reply to `get-peers`: every peer except the requester.
    PeersList {
        peers: Vec<PeerInfo>,
        count: usize,
    },

    /// Broadcast when a peer registers.
    PeerJoined {
        peer: PeerInfo,
        total_peers: usize,
    },

    /// Broadcast when a peer disconnects.
    PeerLeft {
        peer_id: String,
        total_peers: usize,
    },

    /// A relayed SDP offer.
    Offer {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
        data: SdpPayload,
    },

    /// A relayed SDP answer.
    Answer {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
        data: SdpPayload,
    },

    /// A relayed ICE candidate.
    IceCandidate {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
        data: CandidatePayload,
    },

    /// Keepalive response.
    Pong,

    /// Protocol error. The connection stays open.
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// The recipient of a relay envelope, if this message has one.
    /// Used by the connection manager to route without inspecting payloads.
    pub fn target(&self) -> Option<&str> {
        match self {
            ServerMessage::Offer { to, .. }
            | ServerMessage::Answer { to, .. }
            | ServerMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Build an offer relay envelope, stamped now.
    pub fn offer(from: &str, to: &str, session_id: &str, sdp: &str) -> Self {
        ServerMessage::Offer {
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            data: SdpPayload {
                sdp: sdp.to_string(),
                session_id: session_id.to_string(),
            },
        }
    }

    /// Build an answer relay envelope, stamped now.
    pub fn answer(from: &str, to: &str, session_id: &str, sdp: &str) -> Self {
        ServerMessage::Answer {
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            data: SdpPayload {
                sdp: sdp.to_string(),
                session_id: session_id.to_string(),
            },
        }
    }

    /// Build an ICE candidate relay envelope, stamped now.
    pub fn ice_candidate(from: &str, to: &str, session_id: &str, candidate: Value) -> Self {
        ServerMessage::IceCandidate {
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            data: CandidatePayload {
                candidate,
                session_id: session_id.to_string(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

// ── Payloads & Descriptors ────────────────────────────────────────────────────

/// Relay payload for `offer` and `answer` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    pub session_id: String,
}

/// Relay payload for `ice-candidate` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: Value,
    pub session_id: String,
}

/// Snapshot of a connected peer, as exposed to clients and the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub active_sessions: Vec<String>,
    pub user_info: serde_json::Map<String, Value>,
}

/// Snapshot of a call session, as exposed to the inspection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub initiator_id: String,
    pub participants: Vec<String>,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_register_serialization() {
        let json_text = r#"{"type":"register","user_id":"u1","user_info":{"name":"Ada"}}"#;
        let parsed: ClientMessage = serde_json::from_str(json_text).unwrap();
        match parsed {
            ClientMessage::Register { user_id, user_info } => {
                assert_eq!(user_id, "u1");
                assert_eq!(user_info.get("name").unwrap(), "Ada");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_register_user_info_defaults_to_empty() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"register","user_id":"u1"}"#).unwrap();
        match parsed {
            ClientMessage::Register { user_info, .. } => assert!(user_info.is_empty()),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_offer_serialization() {
        let msg = ClientMessage::Offer {
            to: "peer-b".to_string(),
            session_id: "s1".to_string(),
            sdp: "v=0...".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Offer { to, session_id, sdp } => {
                assert_eq!(to, "peer-b");
                assert_eq!(session_id, "s1");
                assert_eq!(sdp, "v=0...");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_kebab_case_tags() {
        let get_peers = serde_json::to_string(&ClientMessage::GetPeers).unwrap();
        assert!(get_peers.contains("\"type\":\"get-peers\""));

        let candidate = serde_json::to_string(&ClientMessage::IceCandidate {
            to: "b".to_string(),
            session_id: "s1".to_string(),
            candidate: json!({"sdpMid": "0"}),
        })
        .unwrap();
        assert!(candidate.contains("\"type\":\"ice-candidate\""));
    }

    #[test]
    fn test_missing_field_error_names_field() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"offer","to":"b"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("session_id"), "error was: {}", err);
    }

    #[test]
    fn test_unknown_type_error_echoes_type() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("teleport"), "error was: {}", err);
    }

    #[test]
    fn test_server_message_connection_ack_serialization() {
        let msg = ServerMessage::ConnectionAck {
            peer_id: "p1".to_string(),
            message: "Connected to signaling server".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connection-ack\""));
        assert!(json.contains("p1"));
    }

    #[test]
    fn test_server_message_peer_left_serialization() {
        let msg = ServerMessage::PeerLeft {
            peer_id: "p1".to_string(),
            total_peers: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"peer-left\""));
        assert!(json.contains("\"total_peers\":3"));
    }

    #[test]
    fn test_offer_envelope_shape() {
        let msg = ServerMessage::offer("peer-a", "peer-b", "s1", "v=0...");
        assert_eq!(msg.target(), Some("peer-b"));

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"from\":\"peer-a\""));
        assert!(json.contains("\"session_id\":\"s1\""));
        assert!(json.contains("timestamp"));
    }

    #[test]
    fn test_candidate_envelope_keeps_candidate_opaque() {
        let candidate = json!({"candidate": "candidate:1 1 UDP ...", "sdpMLineIndex": 0});
        let msg = ServerMessage::ice_candidate("a", "b", "s1", candidate.clone());
        let json = serde_json::to_string(&msg).unwrap();
        let round: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(round["data"]["candidate"], candidate);
        assert_eq!(round["type"], "ice-candidate");
    }

    #[test]
    fn test_target_is_none_for_control_replies() {
        assert_eq!(ServerMessage::Pong.target(), None);
        assert_eq!(ServerMessage::error("nope").target(), None);
        assert_eq!(
            ServerMessage::PeersList {
                peers: vec![],
                count: 0
            }
            .target(),
            None
        );
    }

    #[test]
    fn test_all_client_message_variants_round_trip() {
        let messages = vec![
            ClientMessage::Register {
                user_id: "u1".to_string(),
                user_info: serde_json::Map::new(),
            },
            ClientMessage::GetPeers,
            ClientMessage::Offer {
                to: "b".to_string(),
                session_id: "s1".to_string(),
                sdp: "offer".to_string(),
            },
            ClientMessage::Answer {
                to: "a".to_string(),
                session_id: "s1".to_string(),
                sdp: "answer".to_string(),
            },
            ClientMessage::IceCandidate {
                to: "b".to_string(),
                session_id: "s1".to_string(),
                candidate: json!({"sdpMid": "0"}),
            },
            ClientMessage::Ping,
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }
}
