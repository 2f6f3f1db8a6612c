//! Upstream session lifecycle shared by the stdio and SSE managers.
//!
//! Both managers key live upstream instances by a composite session key,
//! count active downstream connections, and retire idle instances on a
//! periodic sweep. The pieces common to both live here so the reuse-strategy
//! family stays in one table instead of being re-derived per manager.

pub mod sse;
pub mod stdio;

use crate::models::ReuseStrategy;
use crate::tool_server::{ToolCallFn, ToolServer};
use parking_lot::Mutex;
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, ErrorData};
use rmcp::service::Peer;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Translate `(server_id, user_id, session_key, strategy)` into the map key
/// an upstream instance lives under.
pub fn derive_session_key(
    server_id: &str,
    user_id: &str,
    session_key: &str,
    strategy: ReuseStrategy,
) -> String {
    match strategy {
        ReuseStrategy::PerUser => {
            let user = if user_id.is_empty() { "anonymous" } else { user_id };
            format!("{server_id}:user:{user}")
        }
        ReuseStrategy::PerSession => {
            if session_key.is_empty() {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                format!("{server_id}:session:{nanos}")
            } else {
                format!("{server_id}:session:{session_key}")
            }
        }
        ReuseStrategy::Shared | ReuseStrategy::Singleton | ReuseStrategy::PerRequest => {
            server_id.to_string()
        }
    }
}

/// Connection accounting shared between an upstream instance, its leases, and
/// its proxy tool handlers.
pub struct UpstreamShared {
    pub session_key: String,
    pub server_id: String,
    pub strategy: ReuseStrategy,
    pub created_at: Instant,
    active_conns: AtomicI64,
    last_used: Mutex<Instant>,
    user_sessions: Mutex<HashMap<String, u32>>,
}

impl UpstreamShared {
    pub fn new(session_key: String, server_id: String, strategy: ReuseStrategy) -> Self {
        let now = Instant::now();
        Self {
            session_key,
            server_id,
            strategy,
            created_at: now,
            active_conns: AtomicI64::new(0),
            last_used: Mutex::new(now),
            user_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Acquire)
    }

    /// Take one connection slot. Fails when a cap is set and already reached;
    /// `max_concurrent == 0` means unbounded.
    pub fn try_acquire_conn(&self, max_concurrent: u32) -> bool {
        let mut current = self.active_conns.load(Ordering::Acquire);
        loop {
            if max_concurrent > 0 && current >= i64::from(max_concurrent) {
                return false;
            }
            match self.active_conns.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.touch();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    /// Bracket an in-flight proxied call so the idle sweep cannot retire the
    /// upstream underneath it.
    pub fn begin_call(&self) {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn end_call(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn touch(&self) {
        let mut last_used = self.last_used.lock();
        let now = Instant::now();
        if now > *last_used {
            *last_used = now;
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn track_user(&self, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        *self
            .user_sessions
            .lock()
            .entry(user_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn user_session_count(&self) -> usize {
        self.user_sessions.lock().len()
    }
}

/// A held connection slot on an upstream instance, released on drop.
///
/// The router keeps the lease alive for as long as the corresponding
/// protocol-SSE handler is cached, which is what keeps `active_conns` above
/// zero and the upstream out of the idle sweep.
pub struct UpstreamLease {
    shared: Arc<UpstreamShared>,
}

impl UpstreamLease {
    /// Wrap a slot already taken with `try_acquire_conn`.
    pub(crate) fn new(shared: Arc<UpstreamShared>) -> Self {
        Self { shared }
    }

    pub fn session_key(&self) -> &str {
        &self.shared.session_key
    }
}

impl Drop for UpstreamLease {
    fn drop(&mut self) {
        self.shared.release_conn();
    }
}

/// Idle-sweep predicate, one table for the whole strategy family.
pub fn should_close(
    strategy: ReuseStrategy,
    active_conns: i64,
    idle: Duration,
    idle_ttl: Option<Duration>,
    default_idle_ttl: Duration,
) -> bool {
    if active_conns > 0 {
        return false;
    }
    match strategy {
        ReuseStrategy::Singleton => false,
        ReuseStrategy::PerRequest => true,
        ReuseStrategy::PerSession | ReuseStrategy::Shared | ReuseStrategy::PerUser => {
            idle > idle_ttl.unwrap_or(default_idle_ttl)
        }
    }
}

/// Build the adapted protocol server for an upstream: query the tool list
/// once and register a proxy handler per tool. A failed tool-list query
/// yields an empty server rather than a failed acquire.
pub(crate) async fn adapted_tool_server(
    name: String,
    peer: Peer<RoleClient>,
    shared: Arc<UpstreamShared>,
    call_timeout: Duration,
) -> ToolServer {
    let mut server = ToolServer::new(name);

    let tools = match peer.list_all_tools().await {
        Ok(tools) => tools,
        Err(e) => {
            tracing::warn!(
                session_key = %shared.session_key,
                error = %e,
                "failed to list tools from upstream; serving empty toolset"
            );
            return server;
        }
    };

    for tool in tools {
        let tool_name = tool.name.to_string();
        tracing::debug!(session_key = %shared.session_key, tool = %tool_name, "added proxy tool");

        let peer = peer.clone();
        let shared = shared.clone();
        let handler: ToolCallFn = Arc::new(move |args| {
            let peer = peer.clone();
            let shared = shared.clone();
            let tool_name = tool_name.clone();
            Box::pin(async move {
                shared.begin_call();
                let outcome = tokio::time::timeout(
                    call_timeout,
                    peer.call_tool(CallToolRequestParam {
                        name: tool_name.into(),
                        arguments: Some(args),
                    }),
                )
                .await;
                shared.end_call();

                match outcome {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err(ErrorData::internal_error(
                        format!("remote call failed: {e}"),
                        None,
                    )),
                    Err(_) => Err(ErrorData::internal_error(
                        format!("remote call timed out after {}ms", call_timeout.as_millis()),
                        None,
                    )),
                }
            })
        });
        server.add_tool(tool, handler);
    }

    server
}
