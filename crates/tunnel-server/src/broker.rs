//! # Request Broker
//!
//! Owns the Pending Request table, keyed by `(sessionId, requestId)`, and
//! correlates an outbound `request` frame with the `response` metadata and
//! body frames that eventually answer it. This replaces the
//! callback-closure/"awaiter map" pattern the spec calls out in its design
//! notes with a plain table of one-shot channels and absolute deadlines.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use tunnel_protocol::{Frame, RequestMetadata};

use crate::error::AppError;
use crate::link::LinkState;

/// Why a Tunnel Link stopped serving a session's outstanding requests.
#[derive(Debug, Clone, Copy)]
pub enum FailReason {
    LinkReplaced,
    LinkGone,
}

/// The terminal result of a Pending Request, delivered exactly once through
/// its one-shot channel.
#[derive(Debug)]
pub enum BrokerOutcome {
    Completed {
        status_code: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    GatewayTimeout,
    TunnelBodyMissing,
    LinkReplaced,
    LinkGone,
}

impl From<BrokerOutcome> for Result<(u16, HashMap<String, String>, Vec<u8>), AppError> {
    fn from(outcome: BrokerOutcome) -> Self {
        match outcome {
            BrokerOutcome::Completed {
                status_code,
                headers,
                body,
            } => Ok((status_code, headers, body)),
            BrokerOutcome::GatewayTimeout => Err(AppError::GatewayTimeout),
            BrokerOutcome::TunnelBodyMissing => Err(AppError::TunnelBodyMissing),
            BrokerOutcome::LinkReplaced => Err(AppError::UpstreamFailed("link replaced".into())),
            BrokerOutcome::LinkGone => Err(AppError::UpstreamFailed("link gone".into())),
        }
    }
}

enum PendingState {
    AwaitingMetadata,
    AwaitingBody {
        status_code: u16,
        headers: HashMap<String, String>,
    },
    /// Terminal: either completed, timed out, failed, or abandoned. Kept in
    /// the table for `pending_abandon_grace` so a late frame is recognised
    /// and silently discarded rather than mistaken for an unknown request.
    Terminal,
}

struct PendingEntry {
    responder: Mutex<Option<oneshot::Sender<BrokerOutcome>>>,
    state: Mutex<PendingState>,
}

impl PendingEntry {
    /// Delivers `outcome` exactly once. A second call (e.g. a racing
    /// timeout firing after the body already completed the request) is a
    /// no-op because the responder was already taken.
    async fn complete(&self, outcome: BrokerOutcome) {
        *self.state.lock().await = PendingState::Terminal;
        if let Some(tx) = self.responder.lock().await.take() {
            let _ = tx.send(outcome);
        }
    }
}

type Key = (String, u64);

/// A request issued by [`RequestBroker::issue`] and still in flight.
/// Dropping this guard before the request reaches a terminal state marks it
/// failed with *client-gone* — the idiomatic way to observe "the public
/// caller disconnected" in an async Rust handler, since the handler's
/// future is simply cancelled (dropped) by the server on client disconnect.
pub struct IssuedRequest {
    broker: Arc<RequestBroker>,
    key: Key,
    receiver: Option<oneshot::Receiver<BrokerOutcome>>,
}

impl IssuedRequest {
    /// Awaits the terminal outcome. The receiver is kept in `self` (not
    /// taken) until it resolves so that cancelling this call mid-flight —
    /// the public caller disconnecting while this future is still being
    /// polled — still runs `Drop` with a live receiver and marks the
    /// request client-gone.
    pub async fn wait(mut self) -> Result<(u16, HashMap<String, String>, Vec<u8>), AppError> {
        let outcome = match self.receiver.as_mut().expect("wait called twice").await {
            Ok(outcome) => outcome,
            Err(_) => BrokerOutcome::LinkGone,
        };
        self.receiver = None;
        outcome.into()
    }
}

impl Drop for IssuedRequest {
    fn drop(&mut self) {
        // If `wait` already consumed the receiver the request reached a
        // terminal state through the normal path; nothing to do. Otherwise
        // this guard is being dropped mid-flight (client disconnected).
        if self.receiver.is_some() {
            let broker = self.broker.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                broker.mark_client_gone(&key).await;
            });
        }
    }
}

pub struct RequestBroker {
    pending: Arc<DashMap<Key, Arc<PendingEntry>>>,
    unknown_frame_count: AtomicU64,
    overall_timeout: Duration,
    body_timeout: Duration,
    abandon_grace: Duration,
    inline_body_threshold: usize,
}

impl RequestBroker {
    pub fn new(overall_timeout: Duration, body_timeout: Duration, abandon_grace: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            unknown_frame_count: AtomicU64::new(0),
            overall_timeout,
            body_timeout,
            abandon_grace,
            inline_body_threshold: 64 * 1024,
        }
    }

    pub fn unknown_frame_count(&self) -> u64 {
        self.unknown_frame_count.load(Ordering::Relaxed)
    }

    /// Allocates a request id, records a Pending Request, serialises the
    /// request as a single metadata frame, and enqueues it onto the link.
    /// Returns an [`IssuedRequest`] the caller awaits for the terminal
    /// outcome, or an error if the link is congested.
    pub fn issue(
        self: &Arc<Self>,
        session_id: &str,
        request_id: u64,
        link: &LinkState,
        method: &str,
        path: &str,
        url: &str,
        query: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<IssuedRequest, AppError> {
        let key = (session_id.to_string(), request_id);
        let entry = Arc::new(PendingEntry {
            responder: Mutex::new(None),
            state: Mutex::new(PendingState::AwaitingMetadata),
        });
        let (tx, rx) = oneshot::channel();
        // The responder is installed before publishing the entry so no
        // response can race ahead of it.
        *entry.responder.try_lock().expect("fresh mutex") = Some(tx);
        self.pending.insert(key.clone(), entry);

        let needs_trailing_binary = body.len() > self.inline_body_threshold;
        let trailing_body = if needs_trailing_binary { Some(body.clone()) } else { None };

        let metadata = build_request_metadata(
            method,
            path,
            url,
            query,
            headers,
            body,
            self.inline_body_threshold,
        );

        let frame = Frame::Request {
            request_id,
            session_id: session_id.to_string(),
            request: metadata,
        };

        if let Err(e) = link.enqueue_frame(frame) {
            self.pending.remove(&key);
            return Err(e);
        }

        // Large bodies follow their metadata frame as a single binary frame,
        // the same pairing rule the developer agent uses for responses.
        if let Some(trailing_body) = trailing_body {
            if let Err(e) = link.enqueue_binary(trailing_body) {
                self.pending.remove(&key);
                return Err(e);
            }
        }

        self.spawn_overall_timeout(key.clone());

        Ok(IssuedRequest {
            broker: self.clone(),
            key,
            receiver: Some(rx),
        })
    }

    fn spawn_overall_timeout(self: &Arc<Self>, key: Key) {
        let broker = self.clone();
        let deadline = self.overall_timeout;
        let grace = self.abandon_grace;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(entry) = broker.pending.get(&key).map(|e| e.clone()) {
                let already_terminal = matches!(*entry.state.lock().await, PendingState::Terminal);
                if !already_terminal {
                    entry.complete(BrokerOutcome::GatewayTimeout).await;
                }
            }
            broker.schedule_removal(key, grace);
        });
    }

    fn spawn_body_timeout(self: &Arc<Self>, key: Key) {
        let broker = self.clone();
        let deadline = self.body_timeout;
        let grace = self.abandon_grace;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(entry) = broker.pending.get(&key).map(|e| e.clone()) {
                let still_awaiting_body = matches!(*entry.state.lock().await, PendingState::AwaitingBody { .. });
                if still_awaiting_body {
                    entry.complete(BrokerOutcome::TunnelBodyMissing).await;
                    broker.schedule_removal(key, grace);
                }
            }
        });
    }

    fn schedule_removal(self: &Arc<Self>, key: Key, grace: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            broker.pending.remove(&key);
        });
    }

    /// Handles `response` metadata for `(session_id, request_id)`. Unknown
    /// ids bump a bounded counter and otherwise leave broker state alone.
    /// `async` and awaited directly by the caller (the Tunnel Link's reader
    /// loop) rather than fire-and-forget, so a following body frame for the
    /// same request always observes the `AwaitingBody` transition this
    /// performed — a structural happens-before edge instead of an implicit
    /// scheduling guarantee.
    pub async fn handle_response_metadata(
        self: &Arc<Self>,
        session_id: &str,
        request_id: u64,
        status_code: u16,
        headers: HashMap<String, String>,
        body_length: usize,
    ) {
        let key = (session_id.to_string(), request_id);
        let Some(entry) = self.pending.get(&key).map(|e| e.clone()) else {
            self.unknown_frame_count.fetch_add(1, Ordering::Relaxed);
            debug!(session_id, request_id, "response metadata for unknown request discarded");
            return;
        };

        let mut state = entry.state.lock().await;
        match &*state {
            PendingState::AwaitingMetadata => {
                if body_length == 0 {
                    *state = PendingState::Terminal;
                    drop(state);
                    entry
                        .complete(BrokerOutcome::Completed {
                            status_code,
                            headers,
                            body: Vec::new(),
                        })
                        .await;
                    self.schedule_removal(key, self.abandon_grace);
                } else {
                    *state = PendingState::AwaitingBody { status_code, headers };
                    drop(state);
                    self.spawn_body_timeout(key);
                }
            }
            PendingState::AwaitingBody { .. } => {
                warn!(session_id, request_id, "duplicate response metadata ignored");
            }
            PendingState::Terminal => {
                debug!(session_id, request_id, "response metadata after terminal discarded");
            }
        }
    }

    /// Handles a body frame already paired to `request_id` by the Tunnel
    /// Link's single-slot pairing rule. `async` for the same structural
    /// ordering reason as [`Self::handle_response_metadata`].
    pub async fn handle_response_body(self: &Arc<Self>, session_id: &str, request_id: u64, body: Vec<u8>) {
        let key = (session_id.to_string(), request_id);
        let Some(entry) = self.pending.get(&key).map(|e| e.clone()) else {
            self.unknown_frame_count.fetch_add(1, Ordering::Relaxed);
            debug!(session_id, request_id, "body frame for unknown request discarded");
            return;
        };

        let state = entry.state.lock().await;
        match &*state {
            PendingState::AwaitingBody { status_code, headers } => {
                let status_code = *status_code;
                let headers = headers.clone();
                drop(state);
                entry
                    .complete(BrokerOutcome::Completed {
                        status_code,
                        headers,
                        body,
                    })
                    .await;
                self.schedule_removal(key, self.abandon_grace);
            }
            _ => {
                debug!(session_id, request_id, "body frame outside awaiting-body discarded");
            }
        }
    }

    async fn mark_client_gone(&self, key: &Key) {
        if let Some(entry) = self.pending.get(key).map(|e| e.clone()) {
            let mut state = entry.state.lock().await;
            if !matches!(*state, PendingState::Terminal) {
                *state = PendingState::Terminal;
                drop(state);
                // No outcome is sent: the receiver (the cancelled handler)
                // is already gone, so sending would simply fail silently.
                entry.responder.lock().await.take();
                debug!(session_id = %key.0, request_id = key.1, "public caller disconnected, marked client-gone");
            }
        }
    }

    /// Fails every outstanding Pending Request belonging to `session_id` in
    /// a single pass, guaranteed by the Tunnel Link's `serve` loop to run
    /// before the link object is released.
    pub fn fail_all_for_session(self: &Arc<Self>, session_id: &str, reason: FailReason) {
        let keys: Vec<Key> = self
            .pending
            .iter()
            .filter(|e| e.key().0 == session_id)
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let outcome = match reason {
                    FailReason::LinkReplaced => BrokerOutcome::LinkReplaced,
                    FailReason::LinkGone => BrokerOutcome::LinkGone,
                };
                tokio::spawn(async move {
                    entry.complete(outcome).await;
                });
            }
        }
    }
}

fn build_request_metadata(
    method: &str,
    path: &str,
    url: &str,
    query: &str,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    inline_threshold: usize,
) -> RequestMetadata {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    if body.len() <= inline_threshold {
        RequestMetadata {
            method: method.to_string(),
            path: path.to_string(),
            url: url.to_string(),
            headers,
            query: query.to_string(),
            body: Some(STANDARD.encode(&body)),
            body_length: None,
        }
    } else {
        // Large bodies use the metadata+binary pairing rule instead of
        // inline base64; the binary frame is sent by the ingress caller
        // immediately after this metadata frame.
        RequestMetadata {
            method: method.to_string(),
            path: path.to_string(),
            url: url.to_string(),
            headers,
            query: query.to_string(),
            body: None,
            body_length: Some(body.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkRegistry;

    fn test_broker() -> Arc<RequestBroker> {
        Arc::new(RequestBroker::new(
            Duration::from_millis(200),
            Duration::from_millis(100),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn completes_immediately_when_body_length_is_zero() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let issued = broker
            .issue(
                "falcon-meadow",
                0,
                &link,
                "GET",
                "/health",
                "http://falcon-meadow.example.tld/health",
                "",
                HashMap::new(),
                Vec::new(),
            )
            .unwrap();

        broker.handle_response_metadata("falcon-meadow", 0, 200, HashMap::new(), 0).await;
        let (status, _headers, body) = issued.wait().await.unwrap();
        assert_eq!(status, 200);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn completes_after_metadata_then_body() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let issued = broker
            .issue(
                "falcon-meadow",
                1,
                &link,
                "GET",
                "/ping",
                "http://falcon-meadow.example.tld/ping",
                "",
                HashMap::new(),
                Vec::new(),
            )
            .unwrap();

        broker.handle_response_metadata("falcon-meadow", 1, 200, HashMap::new(), 4).await;
        broker.handle_response_body("falcon-meadow", 1, b"pong".to_vec()).await;
        let (status, _headers, body) = issued.wait().await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn overall_timeout_yields_gateway_timeout() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let issued = broker
            .issue(
                "falcon-meadow",
                2,
                &link,
                "GET",
                "/slow",
                "http://falcon-meadow.example.tld/slow",
                "",
                HashMap::new(),
                Vec::new(),
            )
            .unwrap();

        let err = issued.wait().await.unwrap_err();
        assert!(matches!(err, AppError::GatewayTimeout));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded_not_misrouted() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let issued = broker
            .issue(
                "falcon-meadow",
                3,
                &link,
                "GET",
                "/slow",
                "http://falcon-meadow.example.tld/slow",
                "",
                HashMap::new(),
                Vec::new(),
            )
            .unwrap();
        let err = issued.wait().await.unwrap_err();
        assert!(matches!(err, AppError::GatewayTimeout));

        // A late response frame within the abandon grace must not panic or
        // resurrect the request.
        broker.handle_response_metadata("falcon-meadow", 3, 200, HashMap::new(), 0).await;
    }

    #[tokio::test]
    async fn body_sub_deadline_yields_tunnel_body_missing() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let issued = broker
            .issue(
                "falcon-meadow",
                4,
                &link,
                "GET",
                "/slow-body",
                "http://falcon-meadow.example.tld/slow-body",
                "",
                HashMap::new(),
                Vec::new(),
            )
            .unwrap();

        broker.handle_response_metadata("falcon-meadow", 4, 200, HashMap::new(), 10).await;
        let err = issued.wait().await.unwrap_err();
        assert!(matches!(err, AppError::TunnelBodyMissing));
    }

    #[tokio::test]
    async fn fail_all_for_session_completes_every_outstanding_request() {
        let broker = test_broker();
        let registry = LinkRegistry::new();
        let (link, _rx, _) = registry.attach("falcon-meadow", 16, 1 << 20);

        let a = broker
            .issue("falcon-meadow", 5, &link, "GET", "/a", "u", "", HashMap::new(), Vec::new())
            .unwrap();
        let b = broker
            .issue("falcon-meadow", 6, &link, "GET", "/b", "u", "", HashMap::new(), Vec::new())
            .unwrap();

        broker.fail_all_for_session("falcon-meadow", FailReason::LinkReplaced);

        assert!(matches!(a.wait().await.unwrap_err(), AppError::UpstreamFailed(_)));
        assert!(matches!(b.wait().await.unwrap_err(), AppError::UpstreamFailed(_)));
    }

    #[tokio::test]
    async fn unknown_request_id_only_bumps_counter() {
        let broker = test_broker();
        let before = broker.unknown_frame_count();
        broker.handle_response_metadata("falcon-meadow", 999, 200, HashMap::new(), 0).await;
        assert_eq!(broker.unknown_frame_count(), before + 1);
    }
}
