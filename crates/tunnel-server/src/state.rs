//! # Relay State
//!
//! The single owned value constructed once at startup and shared (via
//! `Arc`) across every axum handler and background task, replacing any
//! module-level "global active tunnels" map with explicit, testable state.

use std::sync::Arc;

use crate::broker::RequestBroker;
use crate::config::Config;
use crate::link::LinkRegistry;
use crate::session::SessionDirectory;
use crate::token::ShareTokenService;

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionDirectory>,
    pub links: LinkRegistry,
    pub broker: Arc<RequestBroker>,
    pub tokens: ShareTokenService,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let broker = Arc::new(RequestBroker::new(
            config.request_overall_timeout,
            config.response_body_timeout,
            config.pending_abandon_grace,
        ));
        let sessions = Arc::new(SessionDirectory::new(config.session_capacity));
        Arc::new(Self {
            sessions,
            links: LinkRegistry::new(),
            broker,
            tokens: ShareTokenService::new(),
            config,
        })
    }
}
