//! # Server Configuration
//!
//! Every knob enumerated in the spec's external-interfaces section is read
//! from an environment variable with a documented default, following the
//! `env::var(...).unwrap_or_else(...)` style used across the relay corpus
//! rather than introducing a config-file parser for a handful of flat knobs.

use std::env;
use std::time::Duration;

/// Runtime configuration for the relay. Constructed once at startup and
/// shared (by value, it's `Clone`) across every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public suffix that marks a host as tunnel ingress, e.g. `example.tld`.
    pub tunnel_base_domain: String,
    /// Subdomain labels that are never treated as session identifiers.
    pub reserved_subdomains: Vec<String>,
    /// How long a freshly created session lives without activity.
    pub session_ttl: Duration,
    /// How often the Session Directory sweeps for expired sessions.
    pub expiry_sweep_interval: Duration,
    /// How long an expired/closed session is kept around before removal.
    pub expiry_grace: Duration,
    /// Interval between heartbeat pings on an active Tunnel Link.
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals tolerated before the link is declared dead.
    pub heartbeat_misses: u32,
    /// End-to-end deadline for a broker request.
    pub request_overall_timeout: Duration,
    /// Sub-deadline for the body frame after response metadata arrives.
    pub response_body_timeout: Duration,
    /// How long an abandoned (timed-out/failed) request id is remembered so
    /// a late frame is discarded instead of misrouted.
    pub pending_abandon_grace: Duration,
    /// Max number of frames queued on a Tunnel Link's outgoing channel.
    pub link_outgoing_queue_depth: usize,
    /// Max bytes queued on a Tunnel Link's outgoing channel.
    pub link_outgoing_queue_bytes: usize,
    /// Largest request body the ingress will forward.
    pub max_request_body: usize,
    /// Bit width of newly issued share tokens.
    pub share_token_bits: u32,
    /// Whether the loopback fast-path (direct proxy to `localhost:targetPort`)
    /// is enabled.
    pub local_fast_path: bool,
    /// Whether ingress URLs are rendered as `https://` (production) or
    /// `http://` (development).
    pub production: bool,
    /// Maximum number of live sessions the directory will hold at once.
    pub session_capacity: usize,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default_secs))
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Builds configuration from the process environment, falling back to
    /// the defaults documented in the spec for anything unset.
    pub fn from_env() -> Self {
        Self {
            tunnel_base_domain: env_string("TUNNEL_BASE_DOMAIN", "example.tld"),
            reserved_subdomains: env::var("RESERVED_SUBDOMAINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| {
                    ["api", "www", "app", "admin", "dashboard", "docs", "blog", "status"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
            session_ttl: env_secs("SESSION_TTL_SECS", 24 * 60 * 60),
            expiry_sweep_interval: env_secs("EXPIRY_SWEEP_INTERVAL_SECS", 60),
            expiry_grace: env_secs("EXPIRY_GRACE_SECS", 5 * 60),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", 30),
            heartbeat_misses: env_parsed("HEARTBEAT_MISSES", 2),
            request_overall_timeout: env_secs("REQUEST_OVERALL_TIMEOUT_SECS", 30),
            response_body_timeout: env_secs("RESPONSE_BODY_TIMEOUT_SECS", 5),
            pending_abandon_grace: env_secs("PENDING_ABANDON_GRACE_SECS", 10),
            link_outgoing_queue_depth: env_parsed("LINK_OUTGOING_QUEUE_DEPTH", 256),
            link_outgoing_queue_bytes: env_parsed("LINK_OUTGOING_QUEUE_BYTES", 16 * 1024 * 1024),
            max_request_body: env_parsed("MAX_REQUEST_BODY", 10 * 1024 * 1024),
            share_token_bits: env_parsed("SHARE_TOKEN_BITS", 128),
            local_fast_path: env_bool("LOCAL_FAST_PATH", true),
            production: env_bool("PRODUCTION", false),
            session_capacity: env_parsed("SESSION_CAPACITY", 10_000),
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.production {
            "https"
        } else {
            "http"
        }
    }

    pub fn tunnel_url(&self, session_id: &str) -> String {
        format!("{}://{}.{}", self.scheme(), session_id, self.tunnel_base_domain)
    }

    /// The control API's own base URL, e.g. for building a `shareUrl` that
    /// points at `/tunnel/share/:token` rather than at a session subdomain.
    pub fn control_base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.tunnel_base_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Clear anything a prior test in this process might have set.
        for key in ["TUNNEL_BASE_DOMAIN", "SESSION_TTL_SECS", "LOCAL_FAST_PATH"] {
            env::remove_var(key);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.session_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_misses, 2);
        assert!(cfg.local_fast_path);
        assert!(cfg.reserved_subdomains.contains(&"api".to_string()));
    }

    #[test]
    fn tunnel_url_uses_scheme_from_production_flag() {
        let mut cfg = Config::from_env();
        cfg.tunnel_base_domain = "example.tld".to_string();
        cfg.production = false;
        assert_eq!(cfg.tunnel_url("falcon-meadow"), "http://falcon-meadow.example.tld");
        cfg.production = true;
        assert_eq!(cfg.tunnel_url("falcon-meadow"), "https://falcon-meadow.example.tld");
    }
}
