//! SSE upstream manager: long-lived protocol client sessions to remote SSE
//! tool servers, shared per `server_id`.

use super::{UpstreamLease, UpstreamShared, adapted_tool_server, should_close};
use crate::catalog::Catalog;
use crate::config::RemoteSection;
use crate::error::{GatewayError, Result};
use crate::models::{ReuseStrategy, SseConfig};
use crate::upstream::stdio::AcquiredServer;
use parking_lot::RwLock;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::SseClientTransport;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::{RoleClient, ServiceExt as _};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

type McpClient = RunningService<RoleClient, ()>;

struct SseUpstream {
    shared: Arc<UpstreamShared>,
    config: SseConfig,
    client: tokio::sync::Mutex<Option<McpClient>>,
    peer: Peer<RoleClient>,
}

impl SseUpstream {
    async fn close(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.cancel().await {
                tracing::debug!(
                    server_id = %self.shared.server_id,
                    error = %e,
                    "error closing SSE upstream client"
                );
            }
        }
    }
}

pub struct SseUpstreamManager {
    catalog: Arc<dyn Catalog>,
    sessions: Arc<RwLock<HashMap<String, Arc<SseUpstream>>>>,
    connect_lock: tokio::sync::Mutex<()>,
    ct: CancellationToken,
}

impl SseUpstreamManager {
    pub fn new(catalog: Arc<dyn Catalog>, defaults: RemoteSection, ct: CancellationToken) -> Self {
        let sessions: Arc<RwLock<HashMap<String, Arc<SseUpstream>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        spawn_sweeper(
            sessions.clone(),
            defaults.cleanup_interval(),
            defaults.default_idle_ttl(),
            ct.clone(),
        );

        Self {
            catalog,
            sessions,
            connect_lock: tokio::sync::Mutex::new(()),
            ct,
        }
    }

    /// Acquire the shared upstream client session for `server_id`, connecting
    /// on first use.
    pub async fn acquire(&self, server_id: &str) -> Result<AcquiredServer> {
        let existing = self.sessions.read().get(server_id).cloned();
        if let Some(existing) = existing {
            return Ok(self.reuse(existing).await);
        }

        let _guard = self.connect_lock.lock().await;
        let existing = self.sessions.read().get(server_id).cloned();
        if let Some(existing) = existing {
            return Ok(self.reuse(existing).await);
        }

        let config = self.catalog.sse_config(server_id).await?;
        let upstream = connect_upstream(&config).await?;
        tracing::info!(server_id, base_url = %config.base_url, "connected to remote SSE service");

        upstream.shared.try_acquire_conn(0);
        self.sessions
            .write()
            .insert(server_id.to_string(), upstream.clone());

        let server = self.adapted(&upstream).await;
        Ok(AcquiredServer {
            server,
            lease: UpstreamLease::new(upstream.shared.clone()),
        })
    }

    async fn reuse(&self, upstream: Arc<SseUpstream>) -> AcquiredServer {
        upstream.shared.try_acquire_conn(0);
        tracing::debug!(
            server_id = %upstream.shared.server_id,
            active = upstream.shared.active_conns(),
            "reusing SSE upstream"
        );
        let server = self.adapted(&upstream).await;
        AcquiredServer {
            server,
            lease: UpstreamLease::new(upstream.shared.clone()),
        }
    }

    async fn adapted(&self, upstream: &Arc<SseUpstream>) -> crate::tool_server::ToolServer {
        adapted_tool_server(
            format!("proxy-{}", upstream.shared.server_id),
            upstream.peer.clone(),
            upstream.shared.clone(),
            upstream.config.timeout,
        )
        .await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub async fn shutdown(&self) {
        self.ct.cancel();
        let drained: Vec<Arc<SseUpstream>> =
            self.sessions.write().drain().map(|(_, v)| v).collect();
        for upstream in drained {
            tracing::info!(server_id = %upstream.shared.server_id, "closing SSE upstream");
            upstream.close().await;
        }
    }
}

async fn connect_upstream(config: &SseConfig) -> Result<Arc<SseUpstream>> {
    let url = sse_url(config);
    tracing::info!(url = %url, "connecting to remote SSE service");

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &config.headers {
        if let Ok(n) = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            && let Ok(v) = reqwest::header::HeaderValue::from_str(value)
        {
            headers.insert(n, v);
        }
    }

    let redirect = if config.follow_redirects {
        reqwest::redirect::Policy::limited(config.max_redirects.max(1) as usize)
    } else {
        reqwest::redirect::Policy::none()
    };

    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .redirect(redirect);
    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }
    if let Some(ua) = &config.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    let http = builder
        .build()
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("build HTTP client: {e}")))?;

    let transport = SseClientTransport::start_with_client(
        http,
        SseClientConfig {
            sse_endpoint: url.clone().into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| {
        GatewayError::UpstreamUnavailable(format!("failed to open SSE transport to {url}: {e}"))
    })?;

    let client = match timeout(config.connect_timeout, ().serve(transport)).await {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "failed to connect to remote SSE service '{}': {e}",
                config.server_id
            )));
        }
        Err(_) => {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "connect timeout after {}ms for '{}'",
                config.connect_timeout.as_millis(),
                config.server_id
            )));
        }
    };

    let peer = client.peer().clone();
    Ok(Arc::new(SseUpstream {
        shared: Arc::new(UpstreamShared::new(
            config.server_id.clone(),
            config.server_id.clone(),
            ReuseStrategy::Shared,
        )),
        config: config.clone(),
        client: tokio::sync::Mutex::new(Some(client)),
        peer,
    }))
}

/// Upstream SSE URL: base + path, plus any configured default query params.
fn sse_url(config: &SseConfig) -> String {
    let mut url = format!("{}{}", config.base_url, config.sse_path);
    if !config.query_params.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        let mut params: Vec<(&String, &String)> = config.query_params.iter().collect();
        params.sort();
        for (k, v) in params {
            serializer.append_pair(k, v);
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        url = format!("{url}{sep}{}", serializer.finish());
    }
    url
}

fn spawn_sweeper(
    sessions: Arc<RwLock<HashMap<String, Arc<SseUpstream>>>>,
    interval: Duration,
    default_idle_ttl: Duration,
    ct: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep_idle(&sessions, default_idle_ttl).await,
                () = ct.cancelled() => break,
            }
        }
    });
}

async fn sweep_idle(
    sessions: &RwLock<HashMap<String, Arc<SseUpstream>>>,
    default_idle_ttl: Duration,
) {
    let to_close: Vec<Arc<SseUpstream>> = {
        let mut map = sessions.write();
        let keys: Vec<String> = map
            .iter()
            .filter(|(_, up)| {
                should_close(
                    ReuseStrategy::Shared,
                    up.shared.active_conns(),
                    up.shared.idle_for(),
                    None,
                    default_idle_ttl,
                )
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| map.remove(&k)).collect()
    };

    for upstream in to_close {
        tracing::info!(server_id = %upstream.shared.server_id, "cleaning up idle SSE upstream");
        upstream.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpstreamAuth;

    fn config(base_url: &str, params: &[(&str, &str)]) -> SseConfig {
        SseConfig {
            server_id: "svc_c".into(),
            base_url: base_url.into(),
            sse_path: "/sse".into(),
            auth: UpstreamAuth::None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(3),
            headers: HashMap::new(),
            query_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            follow_redirects: true,
            max_redirects: 5,
            user_agent: None,
        }
    }

    #[test]
    fn sse_url_joins_base_path_and_params() {
        assert_eq!(
            sse_url(&config("http://upstream:8080", &[])),
            "http://upstream:8080/sse"
        );
        assert_eq!(
            sse_url(&config("http://upstream:8080", &[("b", "2"), ("a", "1")])),
            "http://upstream:8080/sse?a=1&b=2"
        );
    }

    #[tokio::test]
    async fn acquire_unknown_server_is_not_found() {
        let catalog = Arc::new(crate::catalog::MemoryCatalog::new());
        let manager = SseUpstreamManager::new(
            catalog,
            RemoteSection::default(),
            CancellationToken::new(),
        );
        let err = manager.acquire("missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServerNotFound(_)));
        manager.shutdown().await;
    }
}
