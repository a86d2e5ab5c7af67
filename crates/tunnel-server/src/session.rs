//! # Session Directory
//!
//! Allocates and tracks [`Session`]s, the identifier-to-metadata mapping the
//! rest of the relay looks entries up through. Modeled as an `Arc<DashMap<..>>`
//! wrapped in a small owning struct, the same lock-free-registry shape the
//! reference relay uses for its agent/connection/session maps, generalized
//! from "one registry per wire concept" to "one registry of `Session`s that
//! every other component addresses by identifier, never by reference" (see
//! the cyclic-object-graph note in the spec's design notes).

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::words::{FIRST_WORDS, SECOND_WORDS};

/// Maximum number of collision retries before `create` gives up.
const MAX_CREATE_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
    Expired,
    Closed,
}

/// One developer's tunnel. `request_counter` backs the Request Broker's
/// per-session monotonic request ids; it lives here rather than in the
/// broker so a session carries everything needed to describe itself. It is
/// an `Arc` because `lookup` hands out clones of `Session` — every clone
/// must still share the one counter or two requests on the same session
/// could be allocated the same id.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub target_port: u16,
    pub status: SessionStatus,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
    pub request_counter: Arc<AtomicU64>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            target_port: self.target_port,
            status: self.status,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            request_counter: self.request_counter.clone(),
        }
    }
}

impl Session {
    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn tunnel_url(&self, cfg: &Config) -> String {
        cfg.tunnel_url(&self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("identifier space exhausted")]
    Exhausted,
    #[error("session directory at capacity")]
    Capacity,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Validates the `^[a-z]{3,}-[a-z]{3,}$` grammar and rejects reserved labels.
pub fn is_valid_identifier(label: &str, reserved: &[String]) -> bool {
    if reserved.iter().any(|r| r == label) {
        return false;
    }
    let Some((first, second)) = label.split_once('-') else {
        return false;
    };
    let word_ok = |w: &str| w.len() >= 3 && w.chars().all(|c| c.is_ascii_lowercase());
    word_ok(first) && word_ok(second) && !second.contains('-')
}

/// Extracts the candidate session label (leftmost host label, port suffix
/// stripped) from a `Host` header value.
pub fn extract_label(host: &str) -> &str {
    let without_port = host.split(':').next().unwrap_or(host);
    without_port.split('.').next().unwrap_or(without_port)
}

pub struct SessionDirectory {
    sessions: Arc<DashMap<String, Session>>,
    capacity: usize,
}

impl SessionDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Allocates a fresh `word-word` identifier and stores a pending
    /// [`Session`] for it. Retries on collision up to `MAX_CREATE_ATTEMPTS`.
    pub fn create(&self, target_port: u16, ttl_secs: u64) -> Result<Session, CreateError> {
        if self.sessions.len() >= self.capacity {
            return Err(CreateError::Capacity);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let first = FIRST_WORDS[rng.gen_range(0..FIRST_WORDS.len())];
            let second = SECOND_WORDS[rng.gen_range(0..SECOND_WORDS.len())];
            let id = format!("{first}-{second}");

            // `entry` gives us an atomic check-and-insert so two concurrent
            // creates can never both win the same identifier.
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let now = now_unix();
                let session = Session {
                    id,
                    target_port,
                    status: SessionStatus::Pending,
                    created_at: now,
                    last_activity_at: now,
                    expires_at: now + ttl_secs,
                    request_counter: Arc::new(AtomicU64::new(0)),
                };
                slot.insert(session.clone());
                return Ok(session);
            }
        }
        Err(CreateError::Exhausted)
    }

    /// Returns the session unless it has been closed or has expired. Per the
    /// spec, `lookup` never surfaces a terminal session even if the sweeper
    /// has not yet physically removed it from the map.
    pub fn lookup(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).and_then(|s| {
            let expired = matches!(s.status, SessionStatus::Pending | SessionStatus::Active)
                && now_unix() >= s.expires_at;
            if expired || matches!(s.status, SessionStatus::Expired | SessionStatus::Closed) {
                None
            } else {
                Some(s.clone())
            }
        })
    }

    /// Looks up a session by the `Host` header of an incoming request,
    /// applying the identifier grammar and reserved-set filter first so an
    /// operator-reserved or malformed label is never mistaken for a tunnel.
    pub fn lookup_by_subdomain(&self, host: &str, reserved: &[String]) -> Option<Session> {
        let label = extract_label(host);
        if !is_valid_identifier(label, reserved) {
            return None;
        }
        self.lookup(label)
    }

    pub fn mark_active(&self, id: &str) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.status = SessionStatus::Active;
            s.last_activity_at = now_unix();
        }
    }

    /// Reverts an active session to pending (used when its Tunnel Link dies
    /// but the session itself is kept around for a reconnect).
    pub fn mark_pending(&self, id: &str) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            if s.status == SessionStatus::Active {
                s.status = SessionStatus::Pending;
            }
        }
    }

    pub fn touch(&self, id: &str) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.last_activity_at = now_unix();
        }
    }

    pub fn close(&self, id: &str) -> bool {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.status = SessionStatus::Closed;
            true
        } else {
            false
        }
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Moves sessions past their hard expiry into `Expired`, then drops
    /// entries that have sat in a terminal state past the grace window.
    /// Called on a fixed interval (`expiry_sweep_interval`, bounded to
    /// <=60s) from a background task spawned in `main`.
    pub fn sweep(&self, grace_secs: u64) {
        let now = now_unix();
        let mut to_remove = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let s = entry.value_mut();
            if matches!(s.status, SessionStatus::Pending | SessionStatus::Active) && now >= s.expires_at {
                s.status = SessionStatus::Expired;
            }
            if matches!(s.status, SessionStatus::Expired | SessionStatus::Closed)
                && now >= s.expires_at + grace_secs
            {
                to_remove.push(s.id.clone());
            }
        }
        for id in to_remove {
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved() -> Vec<String> {
        ["api", "www", "app", "admin", "dashboard", "docs", "blog", "status"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn create_then_lookup_round_trips() {
        let dir = SessionDirectory::new(100);
        let s = dir.create(3000, 3600).unwrap();
        assert!(is_valid_identifier(&s.id, &reserved()));
        let found = dir.lookup(&s.id).unwrap();
        assert_eq!(found.target_port, 3000);
    }

    #[test]
    fn lookup_by_subdomain_rejects_reserved_labels() {
        let dir = SessionDirectory::new(100);
        assert!(dir.lookup_by_subdomain("api.example.tld", &reserved()).is_none());
    }

    #[test]
    fn lookup_by_subdomain_strips_port_and_matches_session() {
        let dir = SessionDirectory::new(100);
        let s = dir.create(8080, 3600).unwrap();
        let host = format!("{}.example.tld:443", s.id);
        let found = dir.lookup_by_subdomain(&host, &reserved()).unwrap();
        assert_eq!(found.id, s.id);
    }

    #[test]
    fn closing_then_looking_up_returns_none_immediately() {
        let dir = SessionDirectory::new(100);
        let s = dir.create(3000, 3600).unwrap();
        assert!(dir.close(&s.id));
        assert!(dir.lookup(&s.id).is_none());
        // The entry is only physically dropped once the sweeper runs past
        // the grace window; a create afterwards must not reuse it early.
        dir.sweep(0);
        assert!(dir.list().is_empty());
    }

    #[test]
    fn create_fails_at_capacity() {
        let dir = SessionDirectory::new(1);
        dir.create(3000, 3600).unwrap();
        assert!(matches!(dir.create(3001, 3600), Err(CreateError::Capacity)));
    }

    #[test]
    fn touch_advances_last_activity_past_creation() {
        let dir = SessionDirectory::new(100);
        let s = dir.create(3000, 3600).unwrap();
        let created_at = s.last_activity_at;
        std::thread::sleep(std::time::Duration::from_secs(1));
        dir.touch(&s.id);
        let touched = dir.lookup(&s.id).unwrap();
        assert!(touched.last_activity_at > created_at);
    }

    #[test]
    fn identifier_grammar_rejects_malformed_labels() {
        let reserved = reserved();
        assert!(!is_valid_identifier("ab-cdef", &reserved)); // first word too short
        assert!(!is_valid_identifier("abcdef", &reserved)); // no hyphen
        assert!(!is_valid_identifier("ABC-def", &reserved)); // uppercase
        assert!(!is_valid_identifier("api", &reserved)); // reserved, no hyphen anyway
        assert!(is_valid_identifier("falcon-meadow", &reserved));
    }
}
