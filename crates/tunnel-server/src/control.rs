//! # Control-Plane HTTP API
//!
//! The developer-facing REST surface: create/inspect/stop tunnels, probe
//! for a local dev server to tunnel, and manage share tokens. Generalizes
//! the reference relay's `api.rs` read-only agent listing into the full
//! request/response surface the relay's control plane needs.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::state::AppState;
use crate::token::IssueOptions;

/// Local ports probed by `GET /tunnel/detect`, in priority order.
const COMMON_DEV_PORTS: &[u16] = &[3000, 3001, 8080, 8000, 4200, 5173, 5000, 8787];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelRequest {
    pub target_port: Option<u16>,
    #[serde(default)]
    #[allow(dead_code)] // advisory only per the spec's open-questions section
    pub enable_p2p: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelResponse {
    pub success: bool,
    pub session_id: String,
    pub tunnel_url: String,
    pub target_port: u16,
    pub status: &'static str,
}

pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<Json<CreateTunnelResponse>, AppError> {
    let port = req.target_port.ok_or(AppError::MissingField("targetPort"))?;
    if port == 0 {
        return Err(AppError::InvalidPort);
    }

    let session = state
        .sessions
        .create(port, state.config.session_ttl.as_secs())
        .map_err(|_| AppError::CapacityExhausted)?;

    Ok(Json(CreateTunnelResponse {
        success: true,
        tunnel_url: session.tunnel_url(&state.config),
        session_id: session.id,
        target_port: session.target_port,
        status: "active",
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusItem {
    pub session_id: String,
    pub tunnel_url: String,
    pub target_port: u16,
    pub created_at: u64,
    pub connection_mode: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusResponse {
    pub active: bool,
    pub tunnels: Vec<TunnelStatusItem>,
}

pub async fn tunnel_status(State(state): State<Arc<AppState>>) -> Json<TunnelStatusResponse> {
    let tunnels: Vec<TunnelStatusItem> = state
        .sessions
        .list()
        .into_iter()
        .map(|s| TunnelStatusItem {
            tunnel_url: s.tunnel_url(&state.config),
            connection_mode: if state.links.get(&s.id).is_some() {
                "connected"
            } else {
                "pending"
            },
            session_id: s.id,
            target_port: s.target_port,
            created_at: s.created_at,
        })
        .collect();

    Json(TunnelStatusResponse {
        active: !tunnels.is_empty(),
        tunnels,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTunnelRequest {
    pub session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTunnelResponse {
    pub success: bool,
    pub stopped: Vec<String>,
}

pub async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopTunnelRequest>,
) -> Result<Json<StopTunnelResponse>, AppError> {
    let stopped = match req.session_id {
        Some(id) => {
            if !state.sessions.close(&id) {
                return Err(AppError::SessionNotFound);
            }
            vec![id]
        }
        None => state
            .sessions
            .list()
            .into_iter()
            .map(|s| {
                state.sessions.close(&s.id);
                s.id
            })
            .collect(),
    };

    Ok(Json(StopTunnelResponse {
        success: true,
        stopped,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectPortsResponse {
    pub detected: Vec<u16>,
    pub suggested: Option<u16>,
}

/// `GET /tunnel/detect` — a 1-second `HEAD` probe against the common local
/// dev ports; suggests the first one that answers. A real HTTP request
/// (rather than a bare TCP connect) so a non-HTTP listener on one of these
/// ports (ssh, a database, ...) doesn't get mistaken for a dev server.
pub async fn detect_ports() -> Json<DetectPortsResponse> {
    let client = reqwest::Client::new();
    let mut detected = Vec::new();
    for &port in COMMON_DEV_PORTS {
        let url = format!("http://127.0.0.1:{port}/");
        let reachable = client
            .head(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .is_ok();
        if reachable {
            detected.push(port);
        }
    }
    let suggested = detected.first().copied();
    Json(DetectPortsResponse { detected, suggested })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueShareRequest {
    pub session_id: String,
    pub label: Option<String>,
    pub expires_in: Option<u64>,
    pub max_accesses: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueShareResponse {
    pub success: bool,
    pub session_id: String,
    pub share_token: String,
    pub share_url: String,
    pub expires_at: Option<u64>,
    pub max_accesses: Option<u64>,
}

pub async fn issue_share(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueShareRequest>,
) -> Result<Json<IssueShareResponse>, AppError> {
    if state.sessions.lookup(&req.session_id).is_none() {
        return Err(AppError::SessionNotFound);
    }

    let token = state.tokens.issue(
        &req.session_id,
        IssueOptions {
            expires_in_secs: req.expires_in.map(|hours| hours * 3600),
            max_accesses: req.max_accesses,
            label: req.label,
        },
    );

    Ok(Json(IssueShareResponse {
        success: true,
        session_id: token.session_id.clone(),
        share_url: format!("{}/tunnel/share/{}", state.config.control_base_url(), token.token),
        expires_at: token.expires_at,
        max_accesses: token.max_accesses,
        share_token: token.token,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveShareResponse {
    pub success: bool,
    pub session_id: String,
    pub remaining_uses: Option<u64>,
    pub label: Option<String>,
}

pub async fn resolve_share(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ResolveShareResponse>, AppError> {
    let resolution = state.tokens.resolve(&token).map_err(|e| match e {
        crate::token::ResolveError::NotFound => AppError::ShareNotFound,
        crate::token::ResolveError::Expired => AppError::ShareExpired,
        crate::token::ResolveError::Exhausted => AppError::ShareExhausted,
    })?;

    Ok(Json(ResolveShareResponse {
        success: true,
        session_id: resolution.session_id,
        remaining_uses: resolution.remaining_uses,
        label: resolution.label,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeShareResponse {
    pub success: bool,
}

pub async fn revoke_share(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<RevokeShareResponse>, AppError> {
    if !state.tokens.revoke(&token) {
        return Err(AppError::ShareNotFound);
    }
    Ok(Json(RevokeShareResponse { success: true }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareListItem {
    pub share_token: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub max_accesses: Option<u64>,
    pub label: Option<String>,
}

pub async fn list_shares(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Vec<ShareListItem>> {
    let shares = state
        .tokens
        .list_by_session(&session_id)
        .into_iter()
        .map(|t| ShareListItem {
            share_token: t.token,
            created_at: t.created_at,
            expires_at: t.expires_at,
            max_accesses: t.max_accesses,
            label: t.label,
        })
        .collect();
    Json(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{delete, get, post};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<AppState>) {
        let state = AppState::new(Config::from_env());
        let router = Router::new()
            .route("/tunnel/create", post(create_tunnel))
            .route("/tunnel/status", get(tunnel_status))
            .route("/tunnel/stop", delete(stop_tunnel))
            .route("/tunnel/share", post(issue_share))
            .route("/tunnel/share/:token", get(resolve_share).delete(revoke_share))
            .route("/tunnel/shares/:sessionId", get(list_shares))
            .with_state(state.clone());
        (router, state)
    }

    #[tokio::test]
    async fn create_tunnel_returns_session_matching_identifier_grammar() {
        let (router, _state) = router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tunnel/create")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"targetPort": 3000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let session_id = json["sessionId"].as_str().unwrap();
        assert!(crate::session::is_valid_identifier(
            session_id,
            &["api".to_string()]
        ));
        assert_eq!(json["tunnelUrl"], format!("http://{session_id}.example.tld"));
    }

    #[tokio::test]
    async fn create_tunnel_without_port_is_bad_request() {
        let (router, _state) = router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tunnel/create")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn share_round_trip_respects_max_accesses() {
        let (router, state) = router();
        let session = state.sessions.create(3000, 3600).unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tunnel/share")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"sessionId": "{}", "maxAccesses": 2}}"#,
                        session.id
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["shareToken"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 32);

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/tunnel/share/{token}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/tunnel/share/{token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let (router, _state) = router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/tunnel/stop")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sessionId": "ghost-runway"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
