//! # Ingress Router
//!
//! The public-facing HTTP front-end. Classifies every inbound request by its
//! `Host` header: a valid, non-reserved subdomain label routes through the
//! Request Broker to the attached Tunnel Link; anything else falls through
//! to the control-plane API router mounted alongside it.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::error::AppError;
use crate::session::{extract_label, is_valid_identifier};
use crate::state::AppState;

/// Headers stripped from the developer's response before it is re-emitted
/// to the public caller; the relay recomputes framing for its own reply.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

fn host_matches_tunnel_domain(host_label_part: &str, base_domain: &str) -> bool {
    host_label_part == base_domain || host_label_part.ends_with(&format!(".{base_domain}"))
}

/// Entry point mounted as the fallback handler on the relay's router: any
/// request whose host does not resolve to the control API's own listener
/// address lands here first.
pub async fn route(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let without_port = host.split(':').next().unwrap_or(&host);
    if !host_matches_tunnel_domain(without_port, &state.config.tunnel_base_domain) {
        return AppError::TunnelNotFound.into_response();
    }

    let label = extract_label(&host);
    if !is_valid_identifier(label, &state.config.reserved_subdomains) {
        return AppError::TunnelNotFound.into_response();
    }

    match forward(&state, label, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(state: &Arc<AppState>, label: &str, request: Request) -> Result<Response, AppError> {
    let session = state.sessions.lookup(label).ok_or(AppError::TunnelNotFound)?;

    if request
        .headers()
        .get(axum::http::header::UPGRADE)
        .is_some()
    {
        if state.config.local_fast_path {
            return proxy_loopback(session.target_port, request).await;
        }
        return Err(AppError::UpgradeNotSupported);
    }

    if state.config.local_fast_path {
        return proxy_loopback(session.target_port, request).await;
    }

    let link = state
        .links
        .get(&session.id)
        .ok_or(AppError::DeveloperNotConnected)?;

    let request_id = session.next_request_id();
    let (parts, body) = request.into_parts();
    let body_bytes = to_bytes(body, state.config.max_request_body)
        .await
        .map_err(|_| AppError::UpstreamFailed("request body exceeded max-request-body".into()))?;

    let query = parts.uri.query().unwrap_or("").to_string();
    let path = parts.uri.path().to_string();
    let url = format!("{}{}", state.config.tunnel_url(&session.id), parts.uri);
    let headers = headers_to_map(&parts.headers);

    let issued = state.broker.issue(
        &session.id,
        request_id,
        &link,
        parts.method.as_str(),
        &path,
        &url,
        &query,
        headers,
        body_bytes.to_vec(),
    )?;

    let (status_code, headers, body) = issued.wait().await?;
    state.sessions.touch(&session.id);
    Ok(build_public_response(status_code, headers, body))
}

/// Direct loopback proxy used only in local-development mode, where the
/// relay and the developer's local server share a host and a Tunnel Link
/// round trip would be pure overhead.
async fn proxy_loopback(target_port: u16, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let body_bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|_| AppError::UpstreamFailed("failed to buffer request body".into()))?;

    let url = format!(
        "http://127.0.0.1:{target_port}{}",
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    let client = reqwest::Client::new();
    let mut builder = client.request(
        reqwest::Method::from_bytes(parts.method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
        &url,
    );
    for (name, value) in parts.headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    builder = builder.header("host", format!("127.0.0.1:{target_port}"));
    builder = builder.body(body_bytes.to_vec());

    let upstream = builder
        .send()
        .await
        .map_err(|e| AppError::UpstreamFailed(e.to_string()))?;

    let status = upstream.status().as_u16();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| AppError::UpstreamFailed(e.to_string()))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers;
    Ok(response)
}

fn headers_to_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

fn build_public_response(
    status_code: u16,
    headers: std::collections::HashMap<String, String>,
    body: Vec<u8>,
) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
    let out = response.headers_mut();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            out.insert(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_matching_accepts_exact_and_subdomain() {
        assert!(host_matches_tunnel_domain("example.tld", "example.tld"));
        assert!(host_matches_tunnel_domain("falcon-meadow.example.tld", "example.tld"));
        assert!(!host_matches_tunnel_domain("evil-example.tld", "example.tld"));
    }

    #[test]
    fn stripped_response_headers_are_lowercase() {
        for h in STRIPPED_RESPONSE_HEADERS {
            assert_eq!(*h, h.to_ascii_lowercase());
        }
    }
}
