//! # Share Token Service
//!
//! Issues and validates unguessable share tokens: 128 bits of randomness
//! from the OS CSPRNG, hex-encoded, with no structural relationship to the
//! session identifier they resolve to. Stored in a `DashMap` keyed by the
//! token itself, mirroring the registry shape used throughout the relay.

use dashmap::DashMap;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct ShareToken {
    pub token: String,
    pub session_id: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub max_accesses: Option<u64>,
    pub access_count: AtomicU64,
    pub last_access_at: AtomicU64,
    pub label: Option<String>,
}

impl Clone for ShareToken {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            max_accesses: self.max_accesses,
            access_count: AtomicU64::new(self.access_count.load(Ordering::Relaxed)),
            last_access_at: AtomicU64::new(self.last_access_at.load(Ordering::Relaxed)),
            label: self.label.clone(),
        }
    }
}

pub struct IssueOptions {
    pub expires_in_secs: Option<u64>,
    pub max_accesses: Option<u64>,
    pub label: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("share token not found")]
    NotFound,
    #[error("share token expired")]
    Expired,
    #[error("share token exhausted")]
    Exhausted,
}

/// Outcome of a successful resolve: enough to build the control-plane
/// response and for the ingress to find the underlying session.
pub struct Resolution {
    pub session_id: String,
    pub remaining_uses: Option<u64>,
    pub label: Option<String>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub struct ShareTokenService {
    tokens: Arc<DashMap<String, ShareToken>>,
}

impl ShareTokenService {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Generates 128 bits of OS randomness and hex-encodes them. A token
    /// never embeds or derives from the session id, so leaking one token
    /// never reveals another session's address.
    fn generate_token() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    pub fn issue(&self, session_id: &str, opts: IssueOptions) -> ShareToken {
        let token = Self::generate_token();
        let now = now_unix();
        let entry = ShareToken {
            token: token.clone(),
            session_id: session_id.to_string(),
            created_at: now,
            expires_at: opts.expires_in_secs.map(|s| now + s),
            max_accesses: opts.max_accesses,
            access_count: AtomicU64::new(0),
            last_access_at: AtomicU64::new(0),
            label: opts.label,
        };
        self.tokens.insert(token, entry.clone());
        entry
    }

    /// Atomically checks expiry/cap and increments the access count. Uses
    /// `fetch_update` so two concurrent resolvers racing for the last
    /// allowed access can never both succeed.
    pub fn resolve(&self, token: &str) -> Result<Resolution, ResolveError> {
        let entry = self.tokens.get(token).ok_or(ResolveError::NotFound)?;

        if let Some(expires_at) = entry.expires_at {
            if now_unix() >= expires_at {
                return Err(ResolveError::Expired);
            }
        }

        let max = entry.max_accesses;
        let updated = entry
            .access_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                match max {
                    Some(m) if count >= m => None,
                    _ => Some(count + 1),
                }
            });

        match updated {
            Ok(prev_count) => {
                entry.last_access_at.store(now_unix(), Ordering::SeqCst);
                let remaining_uses = max.map(|m| m.saturating_sub(prev_count + 1));
                Ok(Resolution {
                    session_id: entry.session_id.clone(),
                    remaining_uses,
                    label: entry.label.clone(),
                })
            }
            Err(_) => Err(ResolveError::Exhausted),
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn list_by_session(&self, session_id: &str) -> Vec<ShareToken> {
        self.tokens
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.value().clone())
            .collect()
    }
}

impl Default for ShareTokenService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_is_32_lowercase_hex_chars() {
        let svc = ShareTokenService::new();
        let t = svc.issue(
            "falcon-meadow",
            IssueOptions {
                expires_in_secs: None,
                max_accesses: None,
                label: None,
            },
        );
        assert_eq!(t.token.len(), 32);
        assert!(t.token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(!t.token.contains("falcon-meadow"));
    }

    #[test]
    fn resolve_respects_max_accesses() {
        let svc = ShareTokenService::new();
        let t = svc.issue(
            "falcon-meadow",
            IssueOptions {
                expires_in_secs: None,
                max_accesses: Some(2),
                label: None,
            },
        );
        assert!(svc.resolve(&t.token).is_ok());
        assert!(svc.resolve(&t.token).is_ok());
        assert!(matches!(svc.resolve(&t.token), Err(ResolveError::Exhausted)));
    }

    #[test]
    fn resolve_respects_expiry() {
        let svc = ShareTokenService::new();
        let t = svc.issue(
            "falcon-meadow",
            IssueOptions {
                expires_in_secs: Some(0),
                max_accesses: None,
                label: None,
            },
        );
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(svc.resolve(&t.token), Err(ResolveError::Expired)));
    }

    #[test]
    fn revoke_then_resolve_returns_not_found() {
        let svc = ShareTokenService::new();
        let t = svc.issue(
            "falcon-meadow",
            IssueOptions {
                expires_in_secs: None,
                max_accesses: None,
                label: None,
            },
        );
        assert!(svc.revoke(&t.token));
        assert!(matches!(svc.resolve(&t.token), Err(ResolveError::NotFound)));
    }

    #[test]
    fn access_count_is_monotone() {
        let svc = ShareTokenService::new();
        let t = svc.issue(
            "falcon-meadow",
            IssueOptions {
                expires_in_secs: None,
                max_accesses: Some(5),
                label: None,
            },
        );
        for _ in 0..5 {
            svc.resolve(&t.token).unwrap();
        }
        let snapshot = svc.list_by_session("falcon-meadow");
        assert_eq!(snapshot[0].access_count.load(Ordering::SeqCst), 5);
    }
}
