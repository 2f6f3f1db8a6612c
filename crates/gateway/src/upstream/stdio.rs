//! Stdio upstream manager: spawn, reuse, cap, and retire subprocess-backed
//! tool servers.

use super::{
    UpstreamLease, UpstreamShared, adapted_tool_server, derive_session_key, should_close,
};
use crate::catalog::Catalog;
use crate::config::RemoteSection;
use crate::error::{GatewayError, Result};
use crate::models::StdioConfig;
use crate::tool_server::ToolServer;
use parking_lot::RwLock;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt as _};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

type McpClient = RunningService<RoleClient, ()>;

/// Rolling window for the `max_restarts` spawn budget.
const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// An acquired upstream: the adapted protocol server plus the connection
/// lease that keeps the upstream alive while the handler stays cached.
pub struct AcquiredServer {
    pub server: ToolServer,
    pub lease: UpstreamLease,
}

struct StdioUpstream {
    shared: Arc<UpstreamShared>,
    config: StdioConfig,
    client: tokio::sync::Mutex<Option<McpClient>>,
    peer: Peer<RoleClient>,
}

impl StdioUpstream {
    async fn close(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.cancel().await {
                tracing::debug!(
                    session_key = %self.shared.session_key,
                    error = %e,
                    "error closing stdio upstream client"
                );
            }
        }
    }
}

pub struct StdioUpstreamManager {
    catalog: Arc<dyn Catalog>,
    defaults: RemoteSection,
    sessions: Arc<RwLock<HashMap<String, Arc<StdioUpstream>>>>,
    /// Serializes creation so concurrent acquires of one key spawn one child.
    spawn_lock: tokio::sync::Mutex<()>,
    restarts: parking_lot::Mutex<HashMap<String, VecDeque<Instant>>>,
    ct: CancellationToken,
}

impl StdioUpstreamManager {
    /// Create the manager and start its idle sweeper.
    pub fn new(catalog: Arc<dyn Catalog>, defaults: RemoteSection, ct: CancellationToken) -> Self {
        let sessions: Arc<RwLock<HashMap<String, Arc<StdioUpstream>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        spawn_sweeper(
            sessions.clone(),
            defaults.cleanup_interval(),
            defaults.default_idle_ttl(),
            ct.clone(),
        );

        Self {
            catalog,
            defaults,
            sessions,
            spawn_lock: tokio::sync::Mutex::new(()),
            restarts: parking_lot::Mutex::new(HashMap::new()),
            ct,
        }
    }

    /// Acquire the upstream for `(server_id, user_id, session_key)` under the
    /// configured reuse strategy, spawning the subprocess on first use.
    pub async fn acquire(
        &self,
        server_id: &str,
        user_id: &str,
        session_key: &str,
    ) -> Result<AcquiredServer> {
        let config = self.catalog.stdio_config(server_id).await?;
        let key = derive_session_key(server_id, user_id, session_key, config.reuse_strategy);

        let existing = self.sessions.read().get(&key).cloned();
        if let Some(existing) = existing {
            return self.reuse(existing, user_id).await;
        }

        let _guard = self.spawn_lock.lock().await;
        let existing = self.sessions.read().get(&key).cloned();
        if let Some(existing) = existing {
            return self.reuse(existing, user_id).await;
        }

        self.check_restart_budget(&key, &config)?;

        tracing::info!(
            server_id,
            session_key = %key,
            strategy = %config.reuse_strategy,
            max_concurrent = config.max_concurrent,
            "creating new stdio upstream"
        );
        let upstream = self.spawn_upstream(&config, &key).await?;

        // The acquiring connection is counted before the session is visible.
        upstream.shared.try_acquire_conn(config.max_concurrent);
        upstream.shared.track_user(user_id);
        self.sessions.write().insert(key.clone(), upstream.clone());

        let server = self.adapted(&upstream).await;
        Ok(AcquiredServer {
            server,
            lease: UpstreamLease::new(upstream.shared.clone()),
        })
    }

    async fn reuse(&self, upstream: Arc<StdioUpstream>, user_id: &str) -> Result<AcquiredServer> {
        let max_concurrent = upstream.config.max_concurrent;
        if !upstream.shared.try_acquire_conn(max_concurrent) {
            return Err(GatewayError::UpstreamCapExceeded {
                server_id: upstream.config.server_id.clone(),
                max_concurrent,
            });
        }
        upstream.shared.track_user(user_id);

        tracing::debug!(
            session_key = %upstream.shared.session_key,
            active = upstream.shared.active_conns(),
            max_concurrent,
            "reusing stdio upstream"
        );
        let server = self.adapted(&upstream).await;
        Ok(AcquiredServer {
            server,
            lease: UpstreamLease::new(upstream.shared.clone()),
        })
    }

    async fn adapted(&self, upstream: &Arc<StdioUpstream>) -> ToolServer {
        adapted_tool_server(
            format!("proxy-{}", upstream.shared.session_key),
            upstream.peer.clone(),
            upstream.shared.clone(),
            self.defaults.default_timeout(),
        )
        .await
    }

    async fn spawn_upstream(&self, config: &StdioConfig, key: &str) -> Result<Arc<StdioUpstream>> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        if let Some(dir) = config.workdir.as_deref().filter(|d| !d.is_empty()) {
            cmd.current_dir(dir);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        // Child stderr lands in the gateway's own log stream.
        cmd.stderr(std::process::Stdio::inherit());

        tracing::info!(
            command = %config.command,
            args = ?config.args,
            "connecting to stdio upstream"
        );

        let transport = TokioChildProcess::new(cmd).map_err(|e| {
            GatewayError::UpstreamUnavailable(format!("failed to spawn '{}': {e}", config.command))
        })?;

        let client = match timeout(config.startup_timeout, ().serve(transport)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(GatewayError::UpstreamUnavailable(format!(
                    "failed to connect to '{}': {e}",
                    config.server_id
                )));
            }
            Err(_) => {
                return Err(GatewayError::UpstreamUnavailable(format!(
                    "startup timeout after {}ms for '{}'",
                    config.startup_timeout.as_millis(),
                    config.server_id
                )));
            }
        };

        let peer = client.peer().clone();
        Ok(Arc::new(StdioUpstream {
            shared: Arc::new(UpstreamShared::new(
                key.to_string(),
                config.server_id.clone(),
                config.reuse_strategy,
            )),
            config: config.clone(),
            client: tokio::sync::Mutex::new(Some(client)),
            peer,
        }))
    }

    /// Bound how often one session key may be re-spawned within the rolling
    /// window. `max_restarts == 0` leaves the budget unbounded.
    fn check_restart_budget(&self, key: &str, config: &StdioConfig) -> Result<()> {
        if config.max_restarts == 0 {
            return Ok(());
        }
        let mut budgets = self.restarts.lock();
        let window = budgets.entry(key.to_string()).or_default();
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > RESTART_WINDOW)
        {
            window.pop_front();
        }
        if window.len() >= config.max_restarts as usize {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "restart budget exhausted for '{key}': {} spawns within {}s",
                window.len(),
                RESTART_WINDOW.as_secs()
            )));
        }
        window.push_back(now);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close every upstream and stop the sweeper.
    pub async fn shutdown(&self) {
        self.ct.cancel();
        let drained: Vec<Arc<StdioUpstream>> = self.sessions.write().drain().map(|(_, v)| v).collect();
        for upstream in drained {
            tracing::info!(session_key = %upstream.shared.session_key, "closing stdio upstream");
            upstream.close().await;
        }
    }
}

fn spawn_sweeper(
    sessions: Arc<RwLock<HashMap<String, Arc<StdioUpstream>>>>,
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
    sessions: &RwLock<HashMap<String, Arc<StdioUpstream>>>,
    default_idle_ttl: Duration,
) {
    // Predicate check and removal happen atomically under the write lock; the
    // client close runs after, outside the lock.
    let to_close: Vec<Arc<StdioUpstream>> = {
        let mut map = sessions.write();
        let keys: Vec<String> = map
            .iter()
            .filter(|(_, up)| {
                should_close(
                    up.shared.strategy,
                    up.shared.active_conns(),
                    up.shared.idle_for(),
                    up.config.idle_ttl,
                    default_idle_ttl,
                )
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| map.remove(&k)).collect()
    };

    for upstream in to_close {
        tracing::info!(
            session_key = %upstream.shared.session_key,
            strategy = %upstream.shared.strategy,
            "closing idle stdio upstream"
        );
        upstream.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReuseStrategy;

    // Per-user reuse: distinct users get distinct session keys; one user's
    // connection slots are capped independently.
    #[test]
    fn per_user_keys_and_caps_are_independent() {
        let alice_key = derive_session_key("svc_b", "alice", "", ReuseStrategy::PerUser);
        let bob_key = derive_session_key("svc_b", "bob", "", ReuseStrategy::PerUser);
        assert_eq!(alice_key, "svc_b:user:alice");
        assert_eq!(bob_key, "svc_b:user:bob");
        assert_ne!(alice_key, bob_key);

        let alice = UpstreamShared::new(alice_key, "svc_b".into(), ReuseStrategy::PerUser);
        let bob = UpstreamShared::new(bob_key, "svc_b".into(), ReuseStrategy::PerUser);

        // Both of alice's slots busy: her third acquire is refused while bob
        // is unaffected.
        assert!(alice.try_acquire_conn(2));
        assert!(alice.try_acquire_conn(2));
        assert!(!alice.try_acquire_conn(2));
        assert!(bob.try_acquire_conn(2));
    }

    #[tokio::test]
    async fn restart_budget_is_a_rolling_window() {
        let catalog = Arc::new(crate::catalog::MemoryCatalog::new());
        let manager = StdioUpstreamManager::new(
            catalog,
            RemoteSection::default(),
            CancellationToken::new(),
        );

        let config = StdioConfig {
            server_id: "svc".into(),
            command: "true".into(),
            args: vec![],
            workdir: None,
            env: HashMap::new(),
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            reuse_strategy: ReuseStrategy::Shared,
            max_concurrent: 0,
            idle_ttl: None,
            max_restarts: 2,
            init_params: None,
        };

        assert!(manager.check_restart_budget("svc", &config).is_ok());
        assert!(manager.check_restart_budget("svc", &config).is_ok());
        let err = manager.check_restart_budget("svc", &config).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));

        // A different key has its own budget.
        assert!(manager.check_restart_budget("svc:user:alice", &config).is_ok());
    }

    #[tokio::test]
    async fn new_manager_has_no_sessions() {
        let catalog = Arc::new(crate::catalog::MemoryCatalog::new());
        let manager = StdioUpstreamManager::new(
            catalog,
            RemoteSection::default(),
            CancellationToken::new(),
        );
        assert_eq!(manager.session_count(), 0);
        manager.shutdown().await;
    }
}
