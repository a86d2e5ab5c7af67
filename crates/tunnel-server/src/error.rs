//! # Relay Errors
//!
//! Every fallible path in the relay resolves to one `AppError` variant, each
//! carrying the status code and machine-readable `code` string the spec's
//! error-handling section assigns it. Handlers return `Result<T, AppError>`
//! and let `IntoResponse` derive the JSON body in one place instead of
//! hand-building `(StatusCode, Json<...>)` tuples at every call site.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("tunnel not found")]
    TunnelNotFound,
    #[error("developer not connected")]
    DeveloperNotConnected,
    #[error("gateway timeout")]
    GatewayTimeout,
    #[error("tunnel body missing")]
    TunnelBodyMissing,
    #[error("upstream failed: {0}")]
    UpstreamFailed(String),
    #[error("link congested")]
    LinkCongested,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid port")]
    InvalidPort,
    #[error("capacity exhausted")]
    CapacityExhausted,
    #[error("session not found")]
    SessionNotFound,
    #[error("share not found")]
    ShareNotFound,
    #[error("share expired")]
    ShareExpired,
    #[error("share exhausted")]
    ShareExhausted,
    #[error("upgrade not supported on tunneled path")]
    UpgradeNotSupported,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    code: &'static str,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::TunnelNotFound => StatusCode::NOT_FOUND,
            AppError::DeveloperNotConnected => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::TunnelBodyMissing => StatusCode::BAD_GATEWAY,
            AppError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::LinkCongested => StatusCode::SERVICE_UNAVAILABLE,
            AppError::MissingField(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidPort => StatusCode::BAD_REQUEST,
            AppError::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SessionNotFound => StatusCode::NOT_FOUND,
            AppError::ShareNotFound => StatusCode::NOT_FOUND,
            AppError::ShareExpired => StatusCode::NOT_FOUND,
            AppError::ShareExhausted => StatusCode::NOT_FOUND,
            AppError::UpgradeNotSupported => StatusCode::NOT_IMPLEMENTED,
        }
    }

    fn error_slug(&self) -> &'static str {
        match self {
            AppError::TunnelNotFound => "tunnel-not-found",
            AppError::DeveloperNotConnected => "developer-not-connected",
            AppError::GatewayTimeout => "gateway-timeout",
            AppError::TunnelBodyMissing => "tunnel-body-missing",
            AppError::UpstreamFailed(_) => "upstream-failed",
            AppError::LinkCongested => "link-congested",
            AppError::MissingField(_) => "missing-field",
            AppError::InvalidPort => "invalid-port",
            AppError::CapacityExhausted => "capacity-exhausted",
            AppError::SessionNotFound => "session-not-found",
            AppError::ShareNotFound => "share-not-found",
            AppError::ShareExpired => "share-expired",
            AppError::ShareExhausted => "share-exhausted",
            AppError::UpgradeNotSupported => "upgrade-not-supported-on-tunneled-path",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::TunnelNotFound => "TUNNEL_NOT_FOUND",
            AppError::DeveloperNotConnected => "DEVELOPER_NOT_CONNECTED",
            AppError::GatewayTimeout => "GATEWAY_TIMEOUT",
            AppError::TunnelBodyMissing => "TUNNEL_BODY_MISSING",
            AppError::UpstreamFailed(_) => "UPSTREAM_FAILED",
            AppError::LinkCongested => "LINK_CONGESTED",
            AppError::MissingField(_) => "MISSING_FIELD",
            AppError::InvalidPort => "INVALID_PORT",
            AppError::CapacityExhausted => "CAPACITY_EXHAUSTED",
            AppError::SessionNotFound => "SESSION_NOT_FOUND",
            AppError::ShareNotFound => "SHARE_NOT_FOUND",
            AppError::ShareExpired => "SHARE_EXPIRED",
            AppError::ShareExhausted => "SHARE_EXHAUSTED",
            AppError::UpgradeNotSupported => "UPGRADE_NOT_SUPPORTED",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, %status, "request failed");
        let body = ErrorBody {
            error: self.error_slug(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
