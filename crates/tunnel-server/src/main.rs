//! # Tunnel Relay Server
//!
//! A reverse-tunnel relay: developer agents open a persistent control
//! channel over WebSocket and declare a session; public HTTP requests
//! arriving at that session's subdomain are correlated with the agent's
//! responses through the Request Broker and returned to the caller.
//!
//! ## Architecture
//!
//! ```text
//! Public caller ──HTTP──► Ingress Router ──► Request Broker ──► Tunnel Link ──WS──► Developer Agent ──HTTP──► localhost:targetPort
//! ```
//!
//! ## Modules
//!
//! - [`config`]   — environment-driven runtime configuration
//! - [`error`]    — the single `AppError` type and its HTTP/JSON mapping
//! - [`words`]    — the two disjoint word lists session identifiers sample from
//! - [`session`]  — the Session Directory
//! - [`token`]    — the Share Token Service
//! - [`link`]     — the Tunnel Link (attach handshake, heartbeat, back-pressure)
//! - [`broker`]   — the Request Broker (Pending Request table, timeouts)
//! - [`ingress`]  — the public-facing subdomain router
//! - [`control`]  — the developer-facing REST control plane
//! - [`state`]    — the shared `AppState` constructed once at startup

mod broker;
mod config;
mod control;
mod error;
mod ingress;
mod link;
mod session;
mod state;
mod token;
mod words;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::link::LinkDeps;
use crate::state::AppState;

/// `GET /ws` — the sole upgrade endpoint a developer agent attaches to.
/// Every other public host is handled by [`ingress::route`] instead.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let deps = Arc::new(LinkDeps {
        sessions: state.sessions.clone(),
        links: state.links.clone(),
        broker: state.broker.clone(),
        heartbeat_interval: state.config.heartbeat_interval,
        heartbeat_misses: state.config.heartbeat_misses,
        outgoing_queue_depth: state.config.link_outgoing_queue_depth,
        outgoing_queue_bytes: state.config.link_outgoing_queue_bytes,
    });
    ws.on_upgrade(move |socket| link::serve(socket, deps))
}

/// Spawns the background sweeper that moves expired sessions to `Expired`
/// and then drops them once they have sat past `expiryGrace`, bounded to
/// run at most once every `expirySweepInterval` (<=60s per the spec).
fn spawn_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.expiry_sweep_interval);
        loop {
            ticker.tick().await;
            state.sessions.sweep(state.config.expiry_grace.as_secs());
        }
    });
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = Config::from_env();
    let state = AppState::new(config);

    spawn_sweeper(state.clone());

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/tunnel/create", post(control::create_tunnel))
        .route("/tunnel/status", get(control::tunnel_status))
        .route("/tunnel/stop", delete(control::stop_tunnel))
        .route("/tunnel/detect", get(control::detect_ports))
        .route("/tunnel/share", post(control::issue_share))
        .route(
            "/tunnel/share/:token",
            get(control::resolve_share).delete(control::revoke_share),
        )
        .route("/tunnel/shares/:sessionId", get(control::list_shares))
        .fallback(ingress::route)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 7070));
    info!("tunnel relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
