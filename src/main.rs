//! WebRTC Signaling Server
//!
//! A lightweight WebSocket coordinator for WebRTC connection establishment:
//!
//! 1. **Peer presence**: Clients connect over a WebSocket, bind a user
//!    identity, and discover which other peers are currently online.
//!
//! 2. **Signaling relay**: SDP offers/answers and ICE candidates are relayed
//!    between peers and recorded per session, so the server can answer
//!    questions about in-flight negotiations.
//!
//! 3. **Session bookkeeping**: Call sessions track their participants and
//!    disappear automatically when the last participant departs.
//!
//! **Privacy**: The server never interprets SDP or candidate payloads. All
//! media and data flows peer-to-peer once negotiation completes.

mod connections;
mod handler;
mod protocol;
mod registry;
mod sessions;
mod state;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{SignalConfig, SignalState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "signal-relay", version, about = "WebRTC signaling server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "SIGNAL_PORT")]
    port: u16,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let state = SignalState::new(SignalConfig { port: args.port });
    let addr = format!("0.0.0.0:{}", state.config.port);

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws/signal/:client_id", get(ws_handler))
        .route("/signal/peers", get(peers_handler))
        .route("/signal/stats", get(stats_handler))
        .route("/signal/sessions", post(create_session_handler))
        .route("/signal/sessions/:session_id", get(get_session_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Signaling server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler. The path segment becomes the peer id for the
/// lifetime of the connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<SignalState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_socket(socket, client_id, state))
}

/// Registered peers, visible without holding a WebSocket.
async fn peers_handler(State(state): State<SignalState>) -> impl IntoResponse {
    let peers = state.available_peers(None);
    Json(json!({
        "peers": peers,
        "count": peers.len(),
    }))
}

/// Full diagnostic snapshot of peers and sessions.
async fn stats_handler(State(state): State<SignalState>) -> impl IntoResponse {
    Json(state.stats())
}

#[derive(Debug, Deserialize)]
struct CreateSessionParams {
    initiator_id: String,
    session_id: Option<String>,
}

/// Create a call session out of band. Idempotent; an existing session is
/// returned untouched. Replies with the session descriptor.
async fn create_session_handler(
    State(state): State<SignalState>,
    Query(params): Query<CreateSessionParams>,
) -> Json<protocol::SessionInfo> {
    let session_id = params
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Json(state.create_session(&session_id, &params.initiator_id))
}

async fn get_session_handler(
    State(state): State<SignalState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.session_info(&session_id) {
        Some(session) => (StatusCode::OK, Json(json!({ "session": session }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Session not found" })),
        ),
    }
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "signal-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
