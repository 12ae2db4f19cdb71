//! WebSocket connection handler.
//!
//! One invocation per physical connection. The handler assigns the
//! path-supplied peer id, acknowledges the transport, then processes frames
//! one at a time: each frame is fully applied (registry mutation + relay)
//! before the next is read, preserving per-connection ordering. Teardown of
//! any kind (close frame, transport error, stream end) funnels through the
//! single cleanup block at the bottom, which is the only place a peer is
//! unregistered and its departure broadcast.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::SignalState;

/// Drive a single client connection for its whole lifetime.
pub async fn handle_socket(socket: WebSocket, peer_id: String, state: SignalState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel for this client; wired into the connection manager
    // before anything else so relays can reach us immediately.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.connections.insert(&peer_id, tx);

    tracing::info!(peer_id = peer_id.as_str(), "WebSocket connected");

    // Transport-level acknowledgment plus the current roster. Queued through
    // the same channel as everything else, so they precede any relay traffic.
    state.connections.send_to(
        &peer_id,
        ServerMessage::ConnectionAck {
            peer_id: peer_id.clone(),
            message: "Connected to signaling server".to_string(),
        },
    );
    state.connections.send_to(
        &peer_id,
        ServerMessage::AvailablePeers {
            peers: state.available_peers(Some(&peer_id)),
        },
    );

    // Sender task: drains the outbound channel onto the socket.
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // Frame loop. Protocol errors answer the sender and keep the connection
    // open; only transport-level failures break out.
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &peer_id, client_msg);
                }
                Err(e) => {
                    tracing::warn!(
                        peer_id = peer_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.connections.send_to(
                        &peer_id,
                        ServerMessage::error(format!("Invalid message: {}", e)),
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(peer_id = peer_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    peer_id = peer_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            // Binary frames and protocol-level ping/pong (axum answers pings
            // itself) are ignored.
            _ => {}
        }
    }

    teardown_connection(&state, &peer_id);
    sender_task.abort();
    tracing::info!(peer_id = peer_id.as_str(), "WebSocket disconnected");
}

/// The single teardown path. Transport handle first so the departing peer
/// cannot be targeted mid-teardown, then identity, then the departure
/// broadcast. A connection that was never registered (or was evicted by a
/// re-registration) leaves silently.
fn teardown_connection(state: &SignalState, peer_id: &str) {
    state.connections.remove(peer_id);
    if state.unregister_peer(peer_id).is_some() {
        state.connections.broadcast(
            &ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
                total_peers: state.peer_count(),
            },
            Some(peer_id),
        );
    }
}

/// Dispatch one parsed frame. Synchronous on purpose: a whole step runs
/// without suspension, so registry mutations and the resulting relay are
/// atomic with respect to other connections.
fn handle_client_message(state: &SignalState, peer_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Register { user_id, user_info } => {
            handle_register(state, peer_id, &user_id, user_info);
        }
        ClientMessage::GetPeers => handle_get_peers(state, peer_id),
        ClientMessage::Offer {
            to,
            session_id,
            sdp,
        } => handle_offer(state, peer_id, &to, &session_id, &sdp),
        ClientMessage::Answer {
            to,
            session_id,
            sdp,
        } => handle_answer(state, peer_id, &to, &session_id, &sdp),
        ClientMessage::IceCandidate {
            to,
            session_id,
            candidate,
        } => handle_ice_candidate(state, peer_id, &to, &session_id, candidate),
        ClientMessage::Ping => {
            state.connections.send_to(peer_id, ServerMessage::Pong);
        }
    }
}

/// Signaling requires an identity. Answers the sender with an error when it
/// has none (including after being evicted by a re-registration elsewhere).
fn require_registered(state: &SignalState, peer_id: &str) -> bool {
    if state.is_registered(peer_id) {
        return true;
    }
    state.connections.send_to(
        peer_id,
        ServerMessage::error("Register with a user_id before signaling"),
    );
    false
}

// ── Message Handlers ──────────────────────────────────────────────────────────

/// Bind this connection to a user identity and announce it.
fn handle_register(
    state: &SignalState,
    peer_id: &str,
    user_id: &str,
    user_info: serde_json::Map<String, Value>,
) {
    if user_id.is_empty() {
        state
            .connections
            .send_to(peer_id, ServerMessage::error("user_id required"));
        return;
    }

    let peer = state.register_peer(peer_id, user_id, user_info);

    state.connections.send_to(
        peer_id,
        ServerMessage::Register {
            success: true,
            peer_id: peer_id.to_string(),
            user_id: user_id.to_string(),
        },
    );

    // Everyone else learns about the newcomer. A peer evicted by this
    // registration gets no departure broadcast; those belong to the cleanup
    // path alone.
    state.connections.broadcast(
        &ServerMessage::PeerJoined {
            peer,
            total_peers: state.peer_count(),
        },
        Some(peer_id),
    );
}

fn handle_get_peers(state: &SignalState, peer_id: &str) {
    if !require_registered(state, peer_id) {
        return;
    }
    let peers = state.available_peers(Some(peer_id));
    let count = peers.len();
    state
        .connections
        .send_to(peer_id, ServerMessage::PeersList { peers, count });
}

/// Record the offer, pull the recipient into the session (creating it if
/// needed, initiator = sender), and relay the envelope.
fn handle_offer(state: &SignalState, from: &str, to: &str, session_id: &str, sdp: &str) {
    if !require_registered(state, from) {
        return;
    }

    tracing::debug!(from, to, session_id, "Relaying offer");
    state.apply_offer(from, to, session_id, sdp);

    if !state
        .connections
        .forward(ServerMessage::offer(from, to, session_id, sdp))
    {
        // Delivery failure is an implicit disconnect of the target, not an
        // error for the sender; a peer-left broadcast follows from the
        // target's own cleanup.
        tracing::debug!(to, "Offer target unreachable");
    }
}

/// Record the answer and relay it. The session must exist already; an answer
/// never creates one.
fn handle_answer(state: &SignalState, from: &str, to: &str, session_id: &str, sdp: &str) {
    if !require_registered(state, from) {
        return;
    }

    if !state.apply_answer(from, session_id, sdp) {
        state.connections.send_to(
            from,
            ServerMessage::error(format!("Unknown session '{}'", session_id)),
        );
        return;
    }

    tracing::debug!(from, to, session_id, "Relaying answer");
    if !state
        .connections
        .forward(ServerMessage::answer(from, to, session_id, sdp))
    {
        tracing::debug!(to, "Answer target unreachable");
    }
}

/// Record the candidate and relay it; same contract as answers.
fn handle_ice_candidate(
    state: &SignalState,
    from: &str,
    to: &str,
    session_id: &str,
    candidate: Value,
) {
    if !require_registered(state, from) {
        return;
    }

    if !state.apply_ice_candidate(from, session_id, candidate.clone()) {
        state.connections.send_to(
            from,
            ServerMessage::error(format!("Unknown session '{}'", session_id)),
        );
        return;
    }

    if !state
        .connections
        .forward(ServerMessage::ice_candidate(from, to, session_id, candidate))
    {
        tracing::debug!(to, "Candidate target unreachable");
    }
}
