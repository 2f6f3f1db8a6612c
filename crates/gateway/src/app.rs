//! HTTP surface: route table and endpoint handlers.

use crate::auth::{AuthState, require_api_key};
use crate::router::{SessionRouter, SessionSnapshot, query_param};
use axum::extract::{Path, Request, State};
use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SessionRouter>,
    pub auth: Arc<AuthState>,
}

/// Assemble the gateway's router: protocol and admin endpoints behind the
/// API-key check; health and the auth diagnostic unauthenticated.
pub fn build_app(router: Arc<SessionRouter>, auth: AuthState) -> Router {
    let state = AppState {
        router,
        auth: Arc::new(auth),
    };

    let protected = Router::new()
        .route("/mcp-server/sse", any(mcp_entry))
        .route("/mcp-server/{server_id}/sse", any(mcp_entry_path))
        .route("/messages", any(session_entry))
        .route("/messages/", any(session_entry))
        .route("/message", any(session_entry))
        .route("/admin/sessions", get(admin_sessions))
        .layer(from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/auth/info", get(auth_info))
        .merge(protected)
        .with_state(state)
}

/// Entry point for `/mcp-server/sse`: a GET with `server_id` is an initial
/// connection; everything else is routed as a session request.
#[axum::debug_handler]
async fn mcp_entry(State(state): State<AppState>, req: Request) -> Response {
    let server_id = query_param(req.uri().query().unwrap_or(""), "server_id");
    match server_id {
        Some(server_id) if req.method() == Method::GET => {
            state.router.handle_initial_connection(&server_id, req).await
        }
        _ => state.router.handle_session_request(req).await,
    }
}

/// Path-mounted variant: `/mcp-server/{server_id}/sse`.
async fn mcp_entry_path(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    req: Request,
) -> Response {
    if req.method() == Method::GET {
        state.router.handle_initial_connection(&server_id, req).await
    } else {
        state.router.handle_session_request(req).await
    }
}

async fn session_entry(State(state): State<AppState>, req: Request) -> Response {
    state.router.handle_session_request(req).await
}

async fn health() -> &'static str {
    "OK"
}

async fn auth_info(State(state): State<AppState>) -> String {
    if state.auth.is_enabled() {
        format!(
            "Authentication: Enabled\nHeader: {}",
            state.auth.header_name()
        )
    } else {
        "Authentication: Disabled".to_string()
    }
}

async fn admin_sessions(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.router.snapshot())
}
