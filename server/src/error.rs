//! Error types for the Darecast server.
//!
//! Each module owns its error enum ([`ConfigError`], [`SessionError`],
//! [`RateLimitError`](crate::rate_limit::RateLimitError),
//! [`BrokerError`](crate::broker::BrokerError)). [`ServerError`] is what HTTP
//! handlers return; it maps every failure to a status code and a JSON body of
//! the form `{"error": "...", "code": "..."}`.
//!
//! # Example
//!
//! ```rust
//! use axum::http::StatusCode;
//! use darecast_server::error::ServerError;
//!
//! let err = ServerError::validation("unknown event type");
//! assert_eq!(err.status(), StatusCode::BAD_REQUEST);
//! assert_eq!(err.code(), "invalid_request");
//! ```

use std::net::IpAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::directory::CollaboratorError;
use crate::session::SessionError;

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Top-level error type for the Darecast server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error during startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Realtime delivery is switched off.
    #[error("realtime delivery is disabled")]
    RealtimeDisabled,

    /// The request's `Origin` is not on the allow-list.
    #[error("origin not allowed: {0}")]
    OriginRejected(String),

    /// The per-IP connection cap is reached.
    #[error("too many connections from {0}")]
    TooManyConnections(IpAddr),

    /// Missing or wrong bearer token.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The identity may not view the resource.
    #[error("access to resource '{0}' denied")]
    Forbidden(String),

    #[error("resource '{0}' not found")]
    NotFound(String),

    /// Malformed request data.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The credential store failed.
    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    /// A collaborator (access policy, history) failed.
    #[error("{0}")]
    Unavailable(#[from] CollaboratorError),

    /// Unexpected internal failure.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::OriginRejected(origin) => Self::OriginRejected(origin),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl ServerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RealtimeDisabled | Self::Session(_) | Self::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::OriginRejected(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::TooManyConnections(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Internal(_) => "internal_error",
            Self::RealtimeDisabled => "realtime_disabled",
            Self::OriginRejected(_) => "origin_rejected",
            Self::TooManyConnections(_) => "too_many_connections",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "invalid_request",
            Self::Session(_) | Self::Unavailable(_) => "unavailable",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    fn public_message(&self) -> String {
        match self {
            // Store and internal details stay in the logs.
            Self::Config(_) | Self::Internal(_) => "internal server error".to_string(),
            Self::Session(_) | Self::Unavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_server_error() && !matches!(self, Self::RealtimeDisabled) {
            error!(error = %self, "Request failed");
        }

        let body = ErrorResponse::new(self.public_message()).with_code(self.code());
        (self.status(), Json(body)).into_response()
    }
}
