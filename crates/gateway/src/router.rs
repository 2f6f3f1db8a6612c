//! Session router: binds HTTP request legs to upstreams.
//!
//! The router owns the two shared registries: the protocol-SSE handler cache
//! (`server_id` -> handler) and the HTTP session map (`session_id` ->
//! [`HttpSession`]), both behind one reader/writer lock. Initial GET legs are
//! classified by adapter; POST legs are routed by session id, with handler
//! inference as the fallback.

use crate::catalog::Catalog;
use crate::config::SessionSection;
use crate::error::{GatewayError, Result};
use crate::models::HttpSession;
use crate::sse_proxy;
use crate::sse_transport::SseProtocolHandler;
use crate::tool_server::ToolServer;
use crate::upstream::UpstreamLease;
use crate::upstream::sse::SseUpstreamManager;
use crate::upstream::stdio::StdioUpstreamManager;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Largest message body the router will buffer for dispatch or forwarding.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Query-parameter aliases for the session id, in lookup order. The aliases
/// arise from heterogeneous client implementations.
const SESSION_ID_ALIASES: [&str; 3] = ["sessionId", "session_id", "sessionid"];

struct CachedHandler {
    handler: SseProtocolHandler,
    /// Holds the upstream connection slot for stdio-backed handlers; dropping
    /// the cache entry releases it.
    _lease: Option<UpstreamLease>,
}

#[derive(Default)]
struct RouterInner {
    handlers: HashMap<String, CachedHandler>,
    sessions: HashMap<String, HttpSession>,
}

#[derive(Serialize)]
pub struct SessionSnapshot {
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub sessions: HashMap<String, HttpSession>,
}

pub struct SessionRouter {
    catalog: Arc<dyn Catalog>,
    stdio: Arc<StdioUpstreamManager>,
    sse: Arc<SseUpstreamManager>,
    builtin: HashMap<String, ToolServer>,
    inner: RwLock<RouterInner>,
    http: reqwest::Client,
    settings: SessionSection,
    ct: CancellationToken,
}

impl SessionRouter {
    /// Create the router and start the HTTP-layer session sweep.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        stdio: Arc<StdioUpstreamManager>,
        sse: Arc<SseUpstreamManager>,
        builtin: HashMap<String, ToolServer>,
        settings: SessionSection,
        ct: CancellationToken,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            catalog,
            stdio,
            sse,
            builtin,
            inner: RwLock::new(RouterInner::default()),
            http: reqwest::Client::new(),
            settings,
            ct: ct.clone(),
        });

        let sweep = router.clone();
        let interval = router.settings.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep.sweep_expired_at(Utc::now()),
                    () = ct.cancelled() => break,
                }
            }
        });

        router
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Record an HTTP session. Used by the transparent proxy (before the
    /// harvested line is flushed downstream) and by first-POST creation.
    pub fn record_session(&self, session: HttpSession) {
        tracing::info!(
            server_id = %session.server_id,
            session_id = %session.session_id,
            proxied = session.sse_config.is_some(),
            "recorded HTTP session"
        );
        self.inner
            .write()
            .sessions
            .insert(session.session_id.clone(), session);
    }

    /// JSON snapshot for `/admin/sessions`.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        let sessions = inner.sessions.clone();
        SessionSnapshot {
            active_sessions: sessions.values().filter(|s| s.is_active).count(),
            total_sessions: sessions.len(),
            sessions,
        }
    }

    /// Server ids that currently have a cached protocol-SSE handler.
    pub fn cached_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Initial connection (GET + server_id)
    // ========================================================================

    pub async fn handle_initial_connection(
        self: &Arc<Self>,
        server_id: &str,
        req: Request,
    ) -> Response {
        tracing::info!(server_id, "handling initial connection");

        if let Some(handler) = self.cached_handler(server_id) {
            tracing::info!(server_id, "using cached protocol handler");
            return handler.handle_sse();
        }

        match self.catalog.is_remote_sse(server_id).await {
            Ok(true) => return sse_proxy::proxy_remote_sse(self.clone(), server_id, req).await,
            Ok(false) => {}
            Err(e) => return e.into_response(),
        }

        let (server, lease) = match self.local_tool_server(server_id).await {
            Ok(v) => v,
            Err(e) => return e.into_response(),
        };

        let handler = SseProtocolHandler::new(server_id, server);
        let handler = {
            let mut inner = self.inner.write();
            match inner.handlers.entry(server_id.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.get().handler.clone(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(CachedHandler {
                        handler: handler.clone(),
                        _lease: lease,
                    });
                    handler
                }
            }
        };

        tracing::info!(server_id, "created and cached protocol handler");
        handler.handle_sse()
    }

    /// Resolve a `server_id` to a locally served `ToolServer`: remote stdio,
    /// then the remote-SSE client adapter, then the built-in cache.
    async fn local_tool_server(
        &self,
        server_id: &str,
    ) -> Result<(ToolServer, Option<UpstreamLease>)> {
        if self.catalog.is_remote_stdio(server_id).await? {
            tracing::info!(server_id, "acquiring remote stdio server");
            let acquired = self.stdio.acquire(server_id, "", "").await?;
            return Ok((acquired.server, Some(acquired.lease)));
        }
        if self.catalog.is_remote_sse(server_id).await? {
            tracing::info!(server_id, "acquiring remote SSE server");
            let acquired = self.sse.acquire(server_id).await?;
            return Ok((acquired.server, Some(acquired.lease)));
        }
        if let Some(server) = self.builtin.get(server_id) {
            tracing::info!(server_id, "using builtin server");
            return Ok((server.clone(), None));
        }
        Err(GatewayError::ServerNotFound(server_id.to_string()))
    }

    fn cached_handler(&self, server_id: &str) -> Option<SseProtocolHandler> {
        self.inner
            .read()
            .handlers
            .get(server_id)
            .map(|c| c.handler.clone())
    }

    // ========================================================================
    // Session requests (POSTs, or anything without a server_id)
    // ========================================================================

    pub async fn handle_session_request(self: &Arc<Self>, req: Request) -> Response {
        tracing::debug!(method = %req.method(), uri = %req.uri(), "handling session request");
        let (parts, body) = req.into_parts();

        let query = parts.uri.query().unwrap_or("");
        if let Some(session_id) = extract_session_id(query) {
            if !is_valid_session_id(&session_id) {
                tracing::warn!(session_id, "invalid session id format");
                return GatewayError::SessionMalformed.into_response();
            }
            return self.route_session_message(&session_id, parts, body).await;
        }

        self.route_by_inference(parts, body).await
    }

    async fn route_session_message(
        self: &Arc<Self>,
        session_id: &str,
        parts: Parts,
        body: Body,
    ) -> Response {
        // Lookup, expiry check, and last_used refresh happen under one
        // critical section.
        let found = {
            let mut inner = self.inner.write();
            let now = Utc::now();
            let expired = inner
                .sessions
                .get(session_id)
                .is_some_and(|s| is_expired(s, self.settings.timeout(), now));
            if expired {
                tracing::info!(session_id, "session expired; removing");
                inner.sessions.remove(session_id);
                None
            } else if let Some(session) = inner.sessions.get_mut(session_id) {
                session.last_used = now;
                Some(session.clone())
            } else {
                None
            }
        };

        if let Some(session) = found {
            tracing::debug!(session_id, server_id = %session.server_id, "routing session message");
            return match session.sse_config {
                None => self.dispatch_local(&session.server_id, session_id, body).await,
                Some(cfg) => self.forward_session_message(&cfg, session_id, parts, body).await,
            };
        }

        // The session was established on a local GET leg but has no router
        // record yet: create it on this first POST.
        let claimed = {
            let inner = self.inner.read();
            inner
                .handlers
                .iter()
                .find(|(_, c)| c.handler.has_session(session_id))
                .map(|(server_id, c)| (server_id.clone(), c.handler.clone()))
        };
        if let Some((server_id, handler)) = claimed {
            self.record_session(HttpSession::new(
                server_id,
                session_id.to_string(),
                None,
            ));
            let body = match read_body(body).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            return handler.handle_message(session_id, &body).await;
        }

        if self.settings.on_demand_sessions
            && let Some((server_id, handler)) = self.infer_target(&parts)
        {
            tracing::warn!(
                session_id,
                server_id = %server_id,
                "creating on-demand session for unknown id (permissive mode)"
            );
            self.record_session(HttpSession::new(
                server_id,
                session_id.to_string(),
                None,
            ));
            let body = match read_body(body).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            return handler.handle_message(session_id, &body).await;
        }

        tracing::warn!(
            session_id,
            "session not found; sessions must be established through the initial GET connection"
        );
        GatewayError::SessionNotFound.into_response()
    }

    async fn dispatch_local(&self, server_id: &str, session_id: &str, body: Body) -> Response {
        let Some(handler) = self.cached_handler(server_id) else {
            tracing::error!(server_id, "handler not found for local session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server handler not available",
            )
                .into_response();
        };
        let body = match read_body(body).await {
            Ok(b) => b,
            Err(resp) => return resp,
        };
        handler.handle_message(session_id, &body).await
    }

    /// No session id at all: fall back to handler inference.
    async fn route_by_inference(self: &Arc<Self>, parts: Parts, body: Body) -> Response {
        let snapshot: Vec<(String, SseProtocolHandler)> = {
            let inner = self.inner.read();
            inner
                .handlers
                .iter()
                .map(|(id, c)| (id.clone(), c.handler.clone()))
                .collect()
        };

        if snapshot.is_empty() {
            tracing::warn!("no cached handlers available for session request");
            return (StatusCode::NOT_FOUND, "No active sessions").into_response();
        }

        if snapshot.len() == 1 {
            tracing::info!(server_id = %snapshot[0].0, "using single cached handler");
            return self.dispatch_anonymous(&snapshot[0].1, &parts, body).await;
        }

        if let Some((server_id, handler)) = self.infer_target(&parts) {
            tracing::info!(server_id = %server_id, "inferred target server");
            return self.dispatch_anonymous(&handler, &parts, body).await;
        }

        tracing::warn!(
            handlers = snapshot.len(),
            uri = %parts.uri,
            "multiple handlers but no way to determine target server"
        );
        GatewayError::RouteAmbiguous(
            "Cannot determine target server; use sessionId parameter".to_string(),
        )
        .into_response()
    }

    /// Infer the target handler from `server_id` substrings in the URL, then
    /// from the `Referer` header. With exactly one cached handler, that
    /// handler wins.
    fn infer_target(&self, parts: &Parts) -> Option<(String, SseProtocolHandler)> {
        let snapshot: Vec<(String, SseProtocolHandler)> = {
            let inner = self.inner.read();
            inner
                .handlers
                .iter()
                .map(|(id, c)| (id.clone(), c.handler.clone()))
                .collect()
        };

        if snapshot.len() == 1 {
            return snapshot.into_iter().next();
        }

        let url = parts.uri.to_string();
        if let Some(found) = snapshot.iter().find(|(id, _)| url.contains(id.as_str())) {
            return Some(found.clone());
        }

        let referer = parts
            .headers
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !referer.is_empty()
            && let Some(found) = snapshot.iter().find(|(id, _)| referer.contains(id.as_str()))
        {
            return Some(found.clone());
        }

        None
    }

    async fn dispatch_anonymous(
        &self,
        handler: &SseProtocolHandler,
        parts: &Parts,
        _body: Body,
    ) -> Response {
        if parts.method == Method::GET {
            return handler.handle_sse();
        }
        // A message POST cannot be routed to a protocol session without an id.
        (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response()
    }

    // ========================================================================
    // Transparent-proxied POST forwarding
    // ========================================================================

    async fn forward_session_message(
        &self,
        cfg: &crate::models::SseConfig,
        session_id: &str,
        parts: Parts,
        body: Body,
    ) -> Response {
        let url = format!("{}/messages/?session_id={}", cfg.base_url, session_id);
        tracing::info!(session_id, url = %url, "forwarding message to remote service");

        let mut headers = parts.headers.clone();
        headers.remove(header::HOST);
        headers.remove(header::CONNECTION);
        headers.remove(header::CONTENT_LENGTH);
        cfg.auth.apply(&mut headers);

        let body = match read_body(body).await {
            Ok(b) => b,
            Err(resp) => return resp,
        };

        let result = self
            .http
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .timeout(cfg.timeout)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                return GatewayError::UpstreamUnavailable(format!(
                    "failed to send message to remote service: {e}"
                ))
                .into_response();
            }
        };

        tracing::debug!(session_id, status = %resp.status(), "remote service responded");
        let status = resp.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in resp.headers() {
            if sse_proxy::is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let bytes = resp.bytes().await.unwrap_or_default();
        builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }

    // ========================================================================
    // HTTP-layer session sweep
    // ========================================================================

    /// Remove sessions idle past the configured timeout; a `server_id` left
    /// with no surviving sessions loses its cached handler as well, which
    /// releases the upstream lease.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) {
        let timeout = self.settings.timeout();
        let mut inner = self.inner.write();

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| is_expired(s, timeout, now))
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut touched: Vec<String> = Vec::new();
        for id in &expired {
            if let Some(session) = inner.sessions.remove(id) {
                touched.push(session.server_id);
            }
        }
        tracing::info!(count = expired.len(), "cleaned up expired sessions");

        touched.sort();
        touched.dedup();
        for server_id in touched {
            let survivors = inner.sessions.values().any(|s| s.server_id == server_id);
            if !survivors && inner.handlers.remove(&server_id).is_some() {
                tracing::info!(server_id = %server_id, "removed handler for inactive server");
            }
        }
    }

    /// Drop all cached handlers and sessions, then stop the sweeper.
    pub fn shutdown(&self) {
        self.ct.cancel();
        let mut inner = self.inner.write();
        inner.handlers.clear();
        inner.sessions.clear();
        tracing::info!("session router shut down");
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Extract the session id from a raw query string, honoring the alias order.
pub fn extract_session_id(query: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    for alias in SESSION_ID_ALIASES {
        if let Some((_, value)) = pairs.iter().find(|(k, _)| k == alias)
            && !value.is_empty()
        {
            return Some(value.clone());
        }
    }
    None
}

/// Session id format: 8-64 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_session_id(session_id: &str) -> bool {
    (8..=64).contains(&session_id.len())
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract a named query parameter from a raw query string.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn is_expired(session: &HttpSession, timeout: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(session.last_used)
        .to_std()
        .is_ok_and(|idle| idle > timeout)
}

async fn read_body(body: Body) -> std::result::Result<bytes::Bytes, Response> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response())
}
