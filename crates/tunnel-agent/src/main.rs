//! # Tunnel Developer Agent
//!
//! A plain async binary: no GUI, no subcommand tree. It opens the relay's
//! control channel, registers against a session identifier handed to it at
//! startup, and for every inbound `request` frame performs a local HTTP call
//! to `localhost:targetPort`, replying with a `response` frame (and a
//! trailing binary frame when the body doesn't fit inline). Connection loss
//! triggers a fixed-backoff reconnect against the same session identifier,
//! generalizing the reference client's `run_agent_loop` from a Tauri
//! background task into the whole of this process's `main`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tunnel_protocol::{Frame, Role};

/// How long to wait before attempting to reconnect after a disconnect.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// How often the agent sends its own heartbeat ping.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for the local forwarding call before the agent gives up and
/// reports `upstream-failed` back to the relay.
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-slot holder for a request whose metadata announced a non-zero
/// body and is still waiting for its binary companion, mirroring the
/// relay's own `LinkState::pending_body` single-slot pairing rule.
struct PendingRequestBody {
    slot: Mutex<Option<(u64, String, tunnel_protocol::RequestMetadata)>>,
}

impl PendingRequestBody {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    async fn set(&self, request_id: u64, session_id: String, request: tunnel_protocol::RequestMetadata) {
        *self.slot.lock().await = Some((request_id, session_id, request));
    }

    /// Claims whatever is in the slot, if anything, leaving it empty.
    async fn take(&self) -> Option<(u64, String, tunnel_protocol::RequestMetadata)> {
        self.slot.lock().await.take()
    }
}

struct AgentConfig {
    relay_url: String,
    session_id: String,
    target_port: u16,
}

impl AgentConfig {
    fn from_env_and_args() -> Self {
        let mut args = std::env::args().skip(1);
        let relay_url = std::env::var("RELAY_URL")
            .ok()
            .or_else(|| args.next())
            .expect("RELAY_URL env var or first positional argument is required");
        let session_id = std::env::var("SESSION_ID")
            .ok()
            .or_else(|| args.next())
            .expect("SESSION_ID env var or second positional argument is required");
        let target_port = std::env::var("TARGET_PORT")
            .ok()
            .or_else(|| args.next())
            .expect("TARGET_PORT env var or third positional argument is required")
            .parse()
            .expect("TARGET_PORT must be a valid port number");

        Self {
            relay_url,
            session_id,
            target_port,
        }
    }

    fn ws_url(&self) -> String {
        format!("{}/ws", self.relay_url.trim_end_matches('/'))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let config = Arc::new(AgentConfig::from_env_and_args());
    info!(session_id = %config.session_id, target_port = config.target_port, "starting tunnel agent");

    loop {
        if let Err(e) = run_once(&config).await {
            error!(error = %e, "connection to relay ended");
        }
        info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_once(config: &Arc<AgentConfig>) -> Result<(), String> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(config.ws_url())
        .await
        .map_err(|e| e.to_string())?;
    info!("connected to relay");

    let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();

    ws_sink
        .send(Message::Text(
            serde_json::to_string(&Frame::Register {
                role: Role::Developer,
                session_id: config.session_id.clone(),
            })
            .unwrap()
            .into(),
        ))
        .await
        .map_err(|e| e.to_string())?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let tx_heartbeat = tx.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let frame = serde_json::to_string(&Frame::Ping).unwrap();
            if tx_heartbeat.send(Message::Text(frame.into())).is_err() {
                break;
            }
        }
    });

    // Request whose metadata announced a non-zero body and is still waiting
    // for its binary companion — the same single-slot pairing discipline the
    // relay's Tunnel Link uses on responses, mirrored here for requests.
    let pending_body = Arc::new(PendingRequestBody::new());

    while let Some(frame) = ws_stream_rx.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Request {
                    request_id,
                    session_id,
                    request,
                }) => {
                    if request.body_length.is_some() {
                        pending_body.set(request_id, session_id.clone(), request).await;
                        continue;
                    }
                    let tx = tx.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let body = request
                            .body
                            .as_deref()
                            .and_then(|b| STANDARD.decode(b).ok())
                            .unwrap_or_default();
                        forward_and_reply(&config, &tx, request_id, &session_id, &request, body).await;
                    });
                }
                Ok(Frame::Ping) => {
                    let _ = tx.send(Message::Text(serde_json::to_string(&Frame::Pong).unwrap().into()));
                }
                Ok(Frame::Pong) => {}
                Ok(Frame::Registered { session_id }) => {
                    info!(session_id, "registered with relay");
                }
                Ok(Frame::Error { message }) => {
                    warn!(message, "relay reported a protocol error");
                }
                Ok(other) => {
                    warn!(?other, "unexpected frame from relay, ignoring");
                }
                Err(e) => {
                    warn!(error = %e, "malformed frame from relay, ignoring");
                }
            },
            Message::Binary(data) => {
                let claimed = pending_body.take().await;
                if let Some((request_id, session_id, request)) = claimed {
                    let tx = tx.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        forward_and_reply(&config, &tx, request_id, &session_id, &request, data.to_vec()).await;
                    });
                } else {
                    warn!("binary frame with no pending request, discarding");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound.abort();
    heartbeat.abort();
    Err("connection closed".to_string())
}

/// Performs the local HTTP call for a request whose body (if any) already
/// arrived inline, then emits the `response` frame pair.
async fn forward_and_reply(
    config: &AgentConfig,
    tx: &mpsc::UnboundedSender<Message>,
    request_id: u64,
    session_id: &str,
    request: &tunnel_protocol::RequestMetadata,
    body: Vec<u8>,
) {
    let url = build_local_url(config.target_port, &request.path, &request.query);
    send_local_request(config, tx, request_id, session_id, &request.method, &url, &request.headers, body).await;
}

/// Builds the `localhost:targetPort` URL a captured public request is
/// forwarded to, reattaching the query string the relay captured separately
/// from the path.
fn build_local_url(target_port: u16, path: &str, query: &str) -> String {
    format!(
        "http://127.0.0.1:{target_port}{path}{}",
        if query.is_empty() {
            String::new()
        } else {
            format!("?{query}")
        }
    )
}

async fn send_local_request(
    config: &AgentConfig,
    tx: &mpsc::UnboundedSender<Message>,
    request_id: u64,
    session_id: &str,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) {
    let client = reqwest::Client::new();
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, url).timeout(LOCAL_REQUEST_TIMEOUT);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder = builder.body(body);

    let (status_code, response_headers, response_body) = match builder.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let headers: HashMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str().to_string(), v.to_string())))
                .collect();
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            (status, headers, body)
        }
        Err(e) => {
            warn!(error = %e, request_id, "local forwarding failed");
            (502, HashMap::new(), Vec::new())
        }
    };

    let response_frame = Frame::Response {
        request_id,
        session_id: session_id.to_string(),
        status_code,
        headers: response_headers,
        body_length: response_body.len(),
    };
    if tx
        .send(Message::Text(serde_json::to_string(&response_frame).unwrap().into()))
        .is_err()
    {
        return;
    }
    if !response_body.is_empty() {
        let _ = tx.send(Message::Binary(response_body.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(query: &str) -> tunnel_protocol::RequestMetadata {
        tunnel_protocol::RequestMetadata {
            method: "GET".to_string(),
            path: "/api/widgets".to_string(),
            url: "http://falcon-meadow.example.tld/api/widgets".to_string(),
            headers: HashMap::new(),
            query: query.to_string(),
            body: None,
            body_length: None,
        }
    }

    #[test]
    fn build_local_url_omits_query_string_when_absent() {
        let url = build_local_url(3000, "/api/widgets", "");
        assert_eq!(url, "http://127.0.0.1:3000/api/widgets");
    }

    #[test]
    fn build_local_url_reattaches_query_string_when_present() {
        let url = build_local_url(3000, "/api/widgets", "limit=10&page=2");
        assert_eq!(url, "http://127.0.0.1:3000/api/widgets?limit=10&page=2");
    }

    #[tokio::test]
    async fn pending_request_body_slot_is_single_use() {
        let slot = PendingRequestBody::new();
        assert!(slot.take().await.is_none());

        slot.set(7, "falcon-meadow".to_string(), sample_request("")).await;
        let (request_id, session_id, request) = slot.take().await.unwrap();
        assert_eq!(request_id, 7);
        assert_eq!(session_id, "falcon-meadow");
        assert_eq!(request.path, "/api/widgets");

        // Claimed exactly once: a second take finds the slot empty.
        assert!(slot.take().await.is_none());
    }

    #[tokio::test]
    async fn pending_request_body_set_overwrites_prior_unclaimed_entry() {
        let slot = PendingRequestBody::new();
        slot.set(1, "falcon-meadow".to_string(), sample_request("a=1")).await;
        slot.set(2, "falcon-meadow".to_string(), sample_request("b=2")).await;

        let (request_id, _session_id, request) = slot.take().await.unwrap();
        assert_eq!(request_id, 2);
        assert_eq!(request.query, "b=2");
    }
}
