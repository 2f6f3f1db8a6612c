//! Shared harness for gateway integration tests: an in-process gateway over a
//! memory catalog, plus SSE stream reading helpers.

use bytes::Bytes;
use futures::Stream;
use futures::StreamExt as _;
use mcpmux_gateway::app::build_app;
use mcpmux_gateway::auth::AuthState;
use mcpmux_gateway::builtin::load_builtin_servers;
use mcpmux_gateway::catalog::{Catalog, MemoryCatalog};
use mcpmux_gateway::config::{AuthSection, RemoteSection, SessionSection};
use mcpmux_gateway::handlers::HandlerRegistry;
use mcpmux_gateway::models::{
    AdapterKind, ServerDescriptor, SseConfig, ToolDescriptor, UpstreamAuth,
};
use mcpmux_gateway::router::SessionRouter;
use mcpmux_gateway::upstream::sse::SseUpstreamManager;
use mcpmux_gateway::upstream::stdio::StdioUpstreamManager;
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TestGateway {
    pub base_url: String,
    pub router: Arc<SessionRouter>,
    pub client: reqwest::Client,
}

pub async fn spawn_gateway(
    catalog: Arc<MemoryCatalog>,
    auth: AuthSection,
    session: SessionSection,
) -> TestGateway {
    let catalog: Arc<dyn Catalog> = catalog;
    let registry = HandlerRegistry::new(catalog.clone());
    let builtin = load_builtin_servers(&catalog, &registry)
        .await
        .expect("load builtin servers");

    let ct = CancellationToken::new();
    let stdio = Arc::new(StdioUpstreamManager::new(
        catalog.clone(),
        RemoteSection::default(),
        ct.child_token(),
    ));
    let sse = Arc::new(SseUpstreamManager::new(
        catalog.clone(),
        RemoteSection::default(),
        ct.child_token(),
    ));
    let router = SessionRouter::new(catalog, stdio, sse, builtin, session, ct.child_token());

    let app = build_app(router.clone(), AuthState::new(&auth));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        router,
        client: reqwest::Client::new(),
    }
}

pub fn no_auth() -> AuthSection {
    AuthSection::default()
}

pub fn api_key_auth(keys: &[&str]) -> AuthSection {
    AuthSection {
        enabled: true,
        header_name: "X-API-Key".to_string(),
        api_keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}

pub fn builtin_service(server_id: &str) -> ServerDescriptor {
    ServerDescriptor {
        server_id: server_id.to_string(),
        display_name: server_id.to_string(),
        adapter: AdapterKind::Builtin,
        enabled: true,
        metadata: None,
    }
}

pub fn sse_service(server_id: &str) -> ServerDescriptor {
    ServerDescriptor {
        server_id: server_id.to_string(),
        display_name: server_id.to_string(),
        adapter: AdapterKind::RemoteSse,
        enabled: true,
        metadata: None,
    }
}

pub fn echo_tool(server_id: &str) -> ToolDescriptor {
    ToolDescriptor {
        server_id: server_id.to_string(),
        name: "echo".to_string(),
        description: "echo text back".to_string(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "text to echo"},
                "prefix": {"type": "string", "description": "optional prefix"}
            },
            "required": ["text"]
        })
        .as_object()
        .cloned(),
        enabled: true,
        handler_type: "builtin_echo".to_string(),
    }
}

pub fn sse_config(server_id: &str, base_url: &str, sse_path: &str, auth: UpstreamAuth) -> SseConfig {
    SseConfig {
        server_id: server_id.to_string(),
        base_url: base_url.to_string(),
        sse_path: sse_path.to_string(),
        auth,
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        retry_attempts: 1,
        retry_delay: Duration::from_secs(1),
        headers: HashMap::from([("X-Default".to_string(), "1".to_string())]),
        query_params: HashMap::new(),
        follow_redirects: true,
        max_redirects: 3,
        user_agent: None,
    }
}

/// Incremental line reader over a streaming HTTP response body.
pub struct SseStream {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
}

impl SseStream {
    pub fn new(resp: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(resp.bytes_stream()),
            buffer: Vec::new(),
        }
    }

    /// Next line without its trailing newline. `None` on end of stream.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                return Some(text.trim_end_matches(['\n', '\r']).to_string());
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(_)) | None => {
                    if self.buffer.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&self.buffer).to_string();
                    self.buffer.clear();
                    return Some(text);
                }
            }
        }
    }

    /// Read until a line containing `needle` appears, bounded by `timeout`.
    pub async fn wait_for_line_containing(
        &mut self,
        needle: &str,
        timeout: Duration,
    ) -> Option<String> {
        tokio::time::timeout(timeout, async {
            while let Some(line) = self.next_line().await {
                if line.contains(needle) {
                    return Some(line);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Payload of the next `data:` line.
    pub async fn next_event_data(&mut self, timeout: Duration) -> Option<String> {
        self.wait_for_line_containing("data: ", timeout)
            .await
            .and_then(|line| line.strip_prefix("data: ").map(str::to_string))
    }
}
