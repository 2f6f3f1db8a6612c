//! Downstream protocol-SSE transport for local tool servers.
//!
//! One handler per `server_id` serves both request legs of the protocol: a
//! long-lived GET producing the event stream (the first event is `endpoint`,
//! declaring the POST URL with the issued session id), and POSTs carrying
//! JSON-RPC messages whose responses are pushed into the owning stream.

use crate::error::GatewayError;
use crate::tool_server::ToolServer;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt as _;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const POST_ENDPOINT: &str = "/messages/";
const PROTOCOL_VERSION: &str = "2024-11-05";
const CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// The cached protocol-SSE handler for one `server_id`.
#[derive(Clone)]
pub struct SseProtocolHandler {
    server_id: String,
    server: ToolServer,
    sessions: Arc<RwLock<HashMap<String, SseSession>>>,
}

struct SseSession {
    tx: mpsc::Sender<String>,
}

/// Removes the transport session when the SSE stream is dropped.
struct SessionGuard {
    server_id: String,
    session_id: String,
    sessions: Arc<RwLock<HashMap<String, SseSession>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.write().remove(&self.session_id);
        tracing::debug!(
            server_id = %self.server_id,
            session_id = %self.session_id,
            "protocol SSE stream closed"
        );
    }
}

/// Session ids are 32 uppercase hex chars, within the 8-64 `[A-Za-z0-9_-]`
/// format the router validates.
fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().to_uppercase()
}

impl SseProtocolHandler {
    pub fn new(server_id: impl Into<String>, server: ToolServer) -> Self {
        Self {
            server_id: server_id.into(),
            server,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Whether this handler issued (and still holds) the given session id.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn register_session(&self) -> (String, mpsc::Receiver<String>, SessionGuard) {
        let session_id = generate_session_id();
        let (tx, rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        self.sessions
            .write()
            .insert(session_id.clone(), SseSession { tx });
        let guard = SessionGuard {
            server_id: self.server_id.clone(),
            session_id: session_id.clone(),
            sessions: self.sessions.clone(),
        };
        (session_id, rx, guard)
    }

    /// GET leg: open the event stream for a new protocol session.
    pub fn handle_sse(&self) -> Response {
        let (session_id, rx, guard) = self.register_session();
        tracing::info!(
            server_id = %self.server_id,
            session_id = %session_id,
            "protocol SSE stream opened"
        );

        let endpoint = format!("{POST_ENDPOINT}?session_id={session_id}");
        let endpoint_event = futures::stream::once(async move {
            Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
        });

        // The guard lives inside the map closure, so dropping the response
        // stream unregisters the session.
        let messages = ReceiverStream::new(rx).map(move |payload| {
            let _held = &guard;
            Ok::<_, Infallible>(Event::default().event("message").data(payload))
        });

        Sse::new(endpoint_event.chain(messages))
            .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
            .into_response()
    }

    /// POST leg: process one JSON-RPC message for an established session.
    /// Responses travel over the session's SSE stream; the POST itself is
    /// acknowledged with 202.
    pub async fn handle_message(&self, session_id: &str, body: &[u8]) -> Response {
        let Ok(message) = serde_json::from_slice::<Value>(body) else {
            return (StatusCode::BAD_REQUEST, "Invalid JSON-RPC message").into_response();
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return (StatusCode::BAD_REQUEST, "Missing method").into_response();
        };

        let Some(tx) = self
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.tx.clone())
        else {
            return GatewayError::SessionNotFound.into_response();
        };

        // Notifications carry no id and get no response.
        let Some(id) = message.get("id").cloned() else {
            tracing::debug!(session_id, method, "notification received");
            return (StatusCode::ACCEPTED, "Accepted").into_response();
        };

        let payload = self
            .process_request(method, id, message.get("params"))
            .await;
        let json = payload.to_string();
        if tx.send(json).await.is_err() {
            return GatewayError::SseNotSupported.into_response();
        }

        (StatusCode::ACCEPTED, "Accepted").into_response()
    }

    async fn process_request(&self, method: &str, id: Value, params: Option<&Value>) -> Value {
        let result: std::result::Result<Value, (i64, String)> = match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": self.server.name(),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.server.tools()})),
            "tools/call" => {
                let name = params.and_then(|p| p.get("name")).and_then(Value::as_str);
                match name {
                    None => Err((INVALID_PARAMS, "missing tool name".to_string())),
                    Some(name) => {
                        let args = params
                            .and_then(|p| p.get("arguments"))
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        match self.server.call_tool(name, args).await {
                            Ok(result) => serde_json::to_value(&result)
                                .map_err(|e| (INTERNAL_ERROR, e.to_string())),
                            Err(err) => {
                                let error = serde_json::to_value(&err).unwrap_or_else(|_| {
                                    json!({"code": INTERNAL_ERROR, "message": err.message})
                                });
                                return json!({"jsonrpc": "2.0", "id": id, "error": error});
                            }
                        }
                    }
                }
            }
            other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };

        match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        }
    }
}
