//! Error kinds surfaced by the gateway core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The catalog database could not be reached or a query failed.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Server '{0}' not found")]
    ServerNotFound(String),

    /// Spawn failure, startup timeout, or broken pipe while talking to an
    /// upstream. Carries the underlying cause; never retried automatically.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Service {server_id} reached maximum concurrent connections ({max_concurrent})")]
    UpstreamCapExceeded {
        server_id: String,
        max_concurrent: u32,
    },

    #[error("Session not found. Please establish connection first.")]
    SessionNotFound,

    #[error("Invalid session ID format")]
    SessionMalformed,

    #[error("{0}")]
    RouteAmbiguous(String),

    #[error("Unauthorized: Invalid API Key")]
    Unauthorized,

    /// The downstream SSE writer is gone; events can no longer be flushed.
    #[error("SSE stream is no longer writable")]
    SseNotSupported,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::CatalogUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::ServerNotFound(_) | GatewayError::SessionNotFound => {
                StatusCode::NOT_FOUND
            }
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamCapExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SessionMalformed | GatewayError::RouteAmbiguous(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::SseNotSupported => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::CatalogUnavailable(e.to_string())
    }
}
