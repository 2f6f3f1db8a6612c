//! API-key authentication for the protocol and admin endpoints.

use crate::app::AppState;
use crate::config::AuthSection;
use crate::error::GatewayError;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const DEFAULT_HEADER_NAME: &str = "X-API-Key";

pub struct AuthState {
    enabled: bool,
    header_name: String,
    api_keys: Vec<String>,
}

impl AuthState {
    pub fn new(section: &AuthSection) -> Self {
        let header_name = if section.header_name.is_empty() {
            DEFAULT_HEADER_NAME.to_string()
        } else {
            section.header_name.clone()
        };
        Self {
            enabled: section.enabled,
            header_name,
            api_keys: section.api_keys.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// A non-empty key matching the allow-list admits the request.
    pub fn validate_api_key(&self, api_key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        !api_key.is_empty() && self.api_keys.iter().any(|k| k == api_key)
    }

    /// Look the key up in the configured header, then `Authorization:
    /// Bearer`, then the `api_key` query parameter.
    pub fn extract_api_key(&self, headers: &HeaderMap, query: &str) -> Option<String> {
        if let Some(key) = headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Some(key.to_string());
        }

        if let Some(token) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|v| !v.is_empty())
        {
            return Some(token.to_string());
        }

        crate::router::query_param(query, "api_key")
    }
}

/// Middleware guarding the protocol and admin routes.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled() {
        return next.run(req).await;
    }

    let query = req.uri().query().unwrap_or("");
    let api_key = state
        .auth
        .extract_api_key(req.headers(), query)
        .unwrap_or_default();

    if state.auth.validate_api_key(&api_key) {
        tracing::debug!(method = %req.method(), path = %req.uri().path(), "authentication successful");
        next.run(req).await
    } else {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "authentication failed");
        GatewayError::Unauthorized.into_response()
    }
}
