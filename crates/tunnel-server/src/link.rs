//! # Tunnel Link
//!
//! The live duplex channel between the relay and one developer agent. This
//! module owns the attach handshake, the bounded outgoing queue that is the
//! relay's sole point of back-pressure toward the developer, the heartbeat
//! watchdog, and the metadata/body frame-pairing discipline described in the
//! spec. It generalizes the reference relay's per-connection reader/writer
//! task pair (`server/src/handlers.rs::handle_connection`) from a raw
//! multiplexed WebSocket relay to a single-session request/response link
//! with explicit heartbeats and back-pressure.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};
use tunnel_protocol::Frame;

use crate::broker::RequestBroker;
use crate::error::AppError;
use crate::session::SessionDirectory;

/// Consecutive malformed frames tolerated before a link is closed.
const MALFORMED_FRAME_LIMIT: u32 = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// One item queued on a Tunnel Link's outgoing channel.
pub enum OutgoingFrame {
    Text(Frame),
    Binary(Vec<u8>),
}

impl OutgoingFrame {
    fn byte_len(&self) -> usize {
        match self {
            OutgoingFrame::Text(frame) => {
                serde_json::to_vec(frame).map(|v| v.len()).unwrap_or(0)
            }
            OutgoingFrame::Binary(data) => data.len(),
        }
    }
}

/// Shared handle to a live Tunnel Link, stored in the [`LinkRegistry`] and
/// cloned into the reader/writer/watchdog tasks that serve it.
pub struct LinkState {
    pub session_id: String,
    tx: mpsc::Sender<OutgoingFrame>,
    queued_bytes: AtomicUsize,
    max_bytes: usize,
    last_heartbeat: AtomicU64,
    /// Request id whose response metadata announced a non-zero `bodyLength`
    /// and is still waiting for its pairing binary frame. `None` means any
    /// binary frame that arrives right now has no home.
    pending_body: Mutex<Option<u64>>,
    shutdown: Notify,
    superseded: AtomicBool,
}

impl LinkState {
    pub fn touch(&self) {
        self.last_heartbeat.store(now_secs(), Ordering::Relaxed);
    }

    fn heartbeat_age_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_heartbeat.load(Ordering::Relaxed))
    }

    /// Enqueues a metadata frame, enforcing both the queue-depth bound
    /// (implicit in the channel's capacity) and the queue-byte bound.
    pub fn enqueue_frame(&self, frame: Frame) -> Result<(), AppError> {
        self.enqueue(OutgoingFrame::Text(frame))
    }

    pub fn enqueue_binary(&self, data: Vec<u8>) -> Result<(), AppError> {
        self.enqueue(OutgoingFrame::Binary(data))
    }

    fn enqueue(&self, item: OutgoingFrame) -> Result<(), AppError> {
        let len = item.byte_len();
        if self.queued_bytes.load(Ordering::Relaxed) + len > self.max_bytes {
            return Err(AppError::LinkCongested);
        }
        self.tx
            .try_send(item)
            .map(|_| {
                self.queued_bytes.fetch_add(len, Ordering::Relaxed);
            })
            .map_err(|_| AppError::LinkCongested)
    }

    async fn set_pending_body(&self, request_id: u64) {
        *self.pending_body.lock().await = Some(request_id);
    }

    /// Claims the request id currently awaiting a body frame, if any. A
    /// binary frame with no match (an empty slot, or one already claimed)
    /// is discarded by the caller.
    async fn take_pending_body(&self) -> Option<u64> {
        self.pending_body.lock().await.take()
    }
}

/// Registry of the single current [`LinkState`] per session. Reattaching
/// atomically replaces the entry and notifies the superseded link's tasks
/// to shut down — the "new attach supersedes the old" rule from the spec.
#[derive(Clone)]
pub struct LinkRegistry {
    links: Arc<DashMap<String, Arc<LinkState>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self {
            links: Arc::new(DashMap::new()),
        }
    }

    /// Installs a brand new link for `session_id`, returning it along with
    /// the receiving half of its outgoing queue and whether an existing
    /// link was superseded.
    pub(crate) fn attach(
        &self,
        session_id: &str,
        depth: usize,
        max_bytes: usize,
    ) -> (Arc<LinkState>, mpsc::Receiver<OutgoingFrame>, bool) {
        let (tx, rx) = mpsc::channel(depth);
        let state = Arc::new(LinkState {
            session_id: session_id.to_string(),
            tx,
            queued_bytes: AtomicUsize::new(0),
            max_bytes,
            last_heartbeat: AtomicU64::new(now_secs()),
            pending_body: Mutex::new(None),
            shutdown: Notify::new(),
            superseded: AtomicBool::new(false),
        });

        let superseded = if let Some(old) = self.links.insert(session_id.to_string(), state.clone()) {
            old.superseded.store(true, Ordering::SeqCst);
            old.shutdown.notify_one();
            true
        } else {
            false
        };

        (state, rx, superseded)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<LinkState>> {
        self.links.get(session_id).map(|e| e.clone())
    }

    /// Removes the registry entry for `session_id` only if `state` is still
    /// the current occupant — a superseded link's own cleanup must not
    /// clobber the newer link that replaced it.
    fn remove_if_current(&self, session_id: &str, state: &Arc<LinkState>) {
        let is_current = self
            .links
            .get(session_id)
            .map(|e| Arc::ptr_eq(&e, state))
            .unwrap_or(false);
        if is_current {
            self.links.remove(session_id);
        }
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dependencies the attach handshake and serve loop need. Kept narrow
/// (rather than the whole `AppState`) so this module stays testable in
/// isolation from the control-plane HTTP surface.
pub struct LinkDeps {
    pub sessions: Arc<SessionDirectory>,
    pub links: LinkRegistry,
    pub broker: Arc<RequestBroker>,
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,
    pub outgoing_queue_depth: usize,
    pub outgoing_queue_bytes: usize,
}

/// Serves one upgraded control-channel WebSocket end to end: handshake,
/// reader/writer/watchdog tasks, and guaranteed broker cleanup on every
/// exit path, per the spec's "scoped acquisition of a Tunnel Link" note.
pub async fn serve(socket: WebSocket, deps: Arc<LinkDeps>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // ── Attach handshake ──
    let register_text = match ws_stream.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = ws_sink
                .send(Message::Text(error_json("expected register frame").into()))
                .await;
            return;
        }
    };

    let frame: Frame = match serde_json::from_str(&register_text) {
        Ok(f) => f,
        Err(_) => {
            let _ = ws_sink
                .send(Message::Text(error_json("malformed register frame").into()))
                .await;
            return;
        }
    };

    let session_id = match frame {
        Frame::Register {
            role: tunnel_protocol::Role::Developer,
            session_id,
        } => session_id,
        _ => {
            let _ = ws_sink
                .send(Message::Text(error_json("expected register frame").into()))
                .await;
            return;
        }
    };

    if deps.sessions.lookup(&session_id).is_none() {
        let _ = ws_sink
            .send(Message::Text(error_json("session not found").into()))
            .await;
        return;
    }

    let (state, mut rx, superseded) = deps.links.attach(
        &session_id,
        deps.outgoing_queue_depth,
        deps.outgoing_queue_bytes,
    );
    deps.sessions.mark_active(&session_id);
    if superseded {
        info!(session_id, "register superseded an existing tunnel link");
        deps.broker.fail_all_for_session(&session_id, crate::broker::FailReason::LinkReplaced);
    }

    if ws_sink
        .send(Message::Text(
            serde_json::to_string(&Frame::Registered {
                session_id: session_id.clone(),
            })
            .unwrap()
            .into(),
        ))
        .await
        .is_err()
    {
        deps.links.remove_if_current(&session_id, &state);
        deps.broker.fail_all_for_session(&session_id, crate::broker::FailReason::LinkGone);
        deps.sessions.mark_pending(&session_id);
        return;
    }
    info!(session_id, "tunnel link attached");

    // ── Writer task: drains the outgoing queue and sends heartbeat pings ──
    let writer_state = state.clone();
    let heartbeat_interval = deps.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                maybe_item = rx.recv() => {
                    let Some(item) = maybe_item else { break };
                    let msg = match &item {
                        OutgoingFrame::Text(frame) => {
                            Message::Text(serde_json::to_string(frame).unwrap().into())
                        }
                        OutgoingFrame::Binary(data) => Message::Binary(data.clone().into()),
                    };
                    writer_state
                        .queued_bytes
                        .fetch_sub(item.byte_len().min(writer_state.queued_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
                    if ws_sink.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if ws_sink
                        .send(Message::Text(serde_json::to_string(&Frame::Ping).unwrap().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // ── Watchdog: closes the link if no traffic is observed for 2x the
    //    heartbeat interval ──
    let watchdog_state = state.clone();
    let misses = deps.heartbeat_misses.max(1);
    let watchdog = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if watchdog_state.heartbeat_age_secs() >= heartbeat_interval.as_secs() * misses as u64 {
                warn!(session_id = %watchdog_state.session_id, "heartbeat lapsed, closing link");
                watchdog_state.shutdown.notify_one();
                break;
            }
        }
    });

    // ── Reader loop: dispatch inbound frames until shutdown or disconnect ──
    let mut malformed_count = 0u32;
    loop {
        tokio::select! {
            _ = state.shutdown.notified() => {
                break;
            }
            next = ws_stream.next() => {
                let Some(Ok(msg)) = next else { break };
                state.touch();
                deps.sessions.touch(&session_id);
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                malformed_count = 0;
                                handle_inbound_frame(&session_id, &state, &deps, frame).await;
                            }
                            Err(e) => {
                                malformed_count += 1;
                                debug!(session_id, error = %e, "malformed frame discarded");
                                let _ = state.enqueue_frame(Frame::Error {
                                    message: "malformed frame".to_string(),
                                });
                                if malformed_count >= MALFORMED_FRAME_LIMIT {
                                    warn!(session_id, "closing link after repeated malformed frames");
                                    break;
                                }
                            }
                        }
                    }
                    Message::Binary(data) => {
                        if let Some(request_id) = state.take_pending_body().await {
                            deps.broker.handle_response_body(&session_id, request_id, data.to_vec()).await;
                        } else {
                            debug!(session_id, "binary frame with no pending metadata discarded");
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    writer.abort();
    watchdog.abort();

    let was_superseded = state.superseded.load(Ordering::SeqCst);
    deps.links.remove_if_current(&session_id, &state);
    if !was_superseded {
        info!(session_id, "tunnel link closed");
        deps.broker.fail_all_for_session(&session_id, crate::broker::FailReason::LinkGone);
        deps.sessions.mark_pending(&session_id);
    }
}

async fn handle_inbound_frame(session_id: &str, state: &Arc<LinkState>, deps: &Arc<LinkDeps>, frame: Frame) {
    match frame {
        Frame::Response {
            request_id,
            status_code,
            headers,
            body_length,
            ..
        } => {
            if body_length > 0 {
                state.set_pending_body(request_id).await;
            }
            deps.broker
                .handle_response_metadata(session_id, request_id, status_code, headers, body_length)
                .await;
        }
        Frame::Ping => {
            let _ = state.enqueue_frame(Frame::Pong);
        }
        Frame::Pong => {
            // `touch()` already ran for every inbound message above.
        }
        Frame::Error { message } => {
            warn!(session_id, message, "developer agent reported an error");
        }
        Frame::Register { .. } | Frame::Registered { .. } | Frame::Request { .. } => {
            debug!(session_id, "unexpected frame type from developer agent, ignoring");
        }
    }
}

fn error_json(message: &str) -> String {
    serde_json::to_string(&Frame::Error {
        message: message.to_string(),
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_marks_old_link_superseded_on_reattach() {
        let registry = LinkRegistry::new();
        let (first, _rx1, superseded1) = registry.attach("falcon-meadow", 4, 1024);
        assert!(!superseded1);
        let (_second, _rx2, superseded2) = registry.attach("falcon-meadow", 4, 1024);
        assert!(superseded2);
        assert!(first.superseded.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_if_current_ignores_stale_handle() {
        let registry = LinkRegistry::new();
        let (first, _rx1, _) = registry.attach("falcon-meadow", 4, 1024);
        let (second, _rx2, _) = registry.attach("falcon-meadow", 4, 1024);
        registry.remove_if_current("falcon-meadow", &first);
        assert!(registry.get("falcon-meadow").is_some());
        registry.remove_if_current("falcon-meadow", &second);
        assert!(registry.get("falcon-meadow").is_none());
    }

    #[tokio::test]
    async fn enqueue_frame_rejects_once_byte_budget_is_exhausted() {
        let registry = LinkRegistry::new();
        let (state, _rx, _) = registry.attach("falcon-meadow", 256, 10);
        let big = Frame::Error {
            message: "x".repeat(100),
        };
        assert!(matches!(state.enqueue_frame(big), Err(AppError::LinkCongested)));
    }

    #[tokio::test]
    async fn pending_body_slot_is_single_use() {
        let registry = LinkRegistry::new();
        let (state, _rx, _) = registry.attach("falcon-meadow", 4, 1024);
        state.set_pending_body(7).await;
        assert_eq!(state.take_pending_body().await, Some(7));
        assert_eq!(state.take_pending_body().await, None);
    }
}
