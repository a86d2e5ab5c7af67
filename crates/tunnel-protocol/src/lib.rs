//! # Tunnel Control Channel Protocol
//!
//! Defines the message types exchanged between the relay and a developer
//! agent over the control channel's duplex WebSocket. This crate is shared
//! (via a `path` dependency) by both `tunnel-server` and `tunnel-agent` so
//! the two sides can never drift out of sync.
//!
//! Every message on the wire is either a **metadata frame** — JSON text,
//! internally tagged by `type` — or a **body frame** — an opaque binary
//! payload that pairs with the most recently announced `bodyLength` for the
//! same `request_id` on the same link. This crate only defines the metadata
//! side; body frames are raw `Vec<u8>` / WebSocket binary messages and carry
//! no type of their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// All possible control-channel metadata messages.
///
/// `#[serde(tag = "type", rename_all = "camelCase")]` serializes each
/// variant as a JSON object with a `"type"` field naming the variant in
/// camelCase, matching the field names used elsewhere on the wire (e.g.
/// `requestId`, `bodyLength`).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Sent by the developer agent immediately after the control channel
    /// upgrade completes, declaring which session it is attaching to.
    Register { role: Role, session_id: String },

    /// Sent by the relay in reply to a successful `register`.
    Registered { session_id: String },

    /// Sent by the relay to the developer agent: a public HTTP request
    /// that needs to be forwarded to `localhost:targetPort`.
    Request {
        request_id: u64,
        session_id: String,
        request: RequestMetadata,
    },

    /// Sent by the developer agent back to the relay once the local call
    /// has produced a status line and headers. If `body_length` is zero the
    /// response is already complete; otherwise a body frame follows.
    Response {
        request_id: u64,
        session_id: String,
        status_code: u16,
        headers: HashMap<String, String>,
        body_length: usize,
    },

    /// Heartbeat probe. Either side may send one; the receiver replies with
    /// `pong` and both directions count as link traffic.
    Ping,

    /// Heartbeat reply.
    Pong,

    /// Carries a human-readable protocol error. Sent by the relay when it
    /// discards a malformed frame, and by the agent when a local call fails
    /// before it can even produce a `response`.
    Error { message: String },
}

/// Who is attaching to a Tunnel Link. The core only ever accepts `Developer`;
/// anything else is rejected during the attach handshake.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
}

/// The captured shape of a public HTTP request, inlined into a `request`
/// metadata frame. Bodies below the broker's inline threshold travel here,
/// base64-encoded; larger bodies are carried by a following binary frame
/// instead (see `tunnel-server::broker`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: String,
    /// Base64-encoded body, present when the body fit inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Set instead of `body` when the payload is large enough to warrant a
    /// trailing binary frame using the same metadata+body pairing rule as
    /// responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_length: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trips_through_json() {
        let frame = Frame::Register {
            role: Role::Developer,
            session_id: "falcon-meadow".to_string(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"register\""));
        assert!(text.contains("\"sessionId\":\"falcon-meadow\""));

        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::Register { role, session_id } => {
                assert_eq!(role, Role::Developer);
                assert_eq!(session_id, "falcon-meadow");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn response_with_zero_body_length_omits_nothing_required() {
        let frame = Frame::Response {
            request_id: 7,
            session_id: "falcon-meadow".to_string(),
            status_code: 200,
            headers: HashMap::new(),
            body_length: 0,
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::Response {
                request_id,
                status_code,
                body_length,
                ..
            } => {
                assert_eq!(request_id, 7);
                assert_eq!(status_code, 200);
                assert_eq!(body_length, 0);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse_rather_than_silently_matching() {
        let text = r#"{"type":"somethingElse"}"#;
        assert!(serde_json::from_str::<Frame>(text).is_err());
    }
}
