//! Read-only tool-server catalog.
//!
//! The gateway treats the catalog as an external collaborator: it enumerates
//! enabled built-in services, classifies a `server_id` by adapter, and hands
//! out per-adapter connection configs. `PostgresCatalog` is the production
//! implementation; `MemoryCatalog` backs tests and ad-hoc wiring.

use crate::config::RemoteSection;
use crate::error::{GatewayError, Result};
use crate::models::{
    AdapterKind, Employee, ReuseStrategy, ServerDescriptor, SseConfig, StdioConfig, ToolDescriptor,
    UpstreamAuth,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::JsonObject;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row as _};
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Enabled services with `adapter = builtin`.
    async fn enabled_builtin_services(&self) -> Result<Vec<ServerDescriptor>>;

    async fn service(&self, server_id: &str) -> Result<Option<ServerDescriptor>>;

    /// Enabled tools of a built-in service.
    async fn enabled_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>>;

    async fn stdio_config(&self, server_id: &str) -> Result<StdioConfig>;

    async fn sse_config(&self, server_id: &str) -> Result<SseConfig>;

    async fn is_remote_stdio(&self, server_id: &str) -> Result<bool>;

    async fn is_remote_sse(&self, server_id: &str) -> Result<bool>;

    /// Lookup used by the database-backed built-in tools.
    async fn employee_by_name(&self, name: &str) -> Result<Option<Employee>>;
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
    defaults: RemoteSection,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool, defaults: RemoteSection) -> Self {
        Self { pool, defaults }
    }

    fn service_from_row(row: &PgRow) -> Result<ServerDescriptor> {
        let adapter: String = row.try_get("adapter")?;
        Ok(ServerDescriptor {
            server_id: row.try_get("server_id")?,
            display_name: row.try_get("display_name")?,
            adapter: AdapterKind::parse(&adapter).unwrap_or(AdapterKind::Builtin),
            enabled: row.try_get("enabled")?,
            metadata: json_object(row.try_get::<Option<Value>, _>("metadata")?),
        })
    }

    /// Millisecond columns use 0 as "unset"; unset falls back to the given
    /// default.
    fn ms_or(ms: i64, default: Duration) -> Duration {
        if ms > 0 {
            Duration::from_millis(ms as u64)
        } else {
            default
        }
    }
}

fn json_object(v: Option<Value>) -> Option<JsonObject> {
    v.and_then(|v| match v {
        Value::Object(map) => Some(map),
        _ => None,
    })
}

fn string_map(v: Option<Value>) -> HashMap<String, String> {
    json_object(v)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn enabled_builtin_services(&self) -> Result<Vec<ServerDescriptor>> {
        let rows = sqlx::query(
            r"
            SELECT server_id, display_name, adapter, enabled, metadata
            FROM mcp_service
            WHERE enabled = true AND adapter = 'builtin'
            ORDER BY server_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::service_from_row).collect()
    }

    async fn service(&self, server_id: &str) -> Result<Option<ServerDescriptor>> {
        let row = sqlx::query(
            r"
            SELECT server_id, display_name, adapter, enabled, metadata
            FROM mcp_service
            WHERE server_id = $1
            ",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::service_from_row).transpose()
    }

    async fn enabled_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>> {
        let rows = sqlx::query(
            r"
            SELECT server_id, name, description, args_schema, enabled, handler_type
            FROM mcp_tool
            WHERE server_id = $1 AND enabled = true
            ORDER BY name
            ",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ToolDescriptor {
                    server_id: row.try_get("server_id")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    args_schema: json_object(row.try_get::<Option<Value>, _>("args_schema")?),
                    enabled: row.try_get("enabled")?,
                    handler_type: row.try_get("handler_type")?,
                })
            })
            .collect()
    }

    async fn stdio_config(&self, server_id: &str) -> Result<StdioConfig> {
        let row = sqlx::query(
            r"
            SELECT server_id, command, args, workdir, env,
                   startup_timeout_ms, shutdown_timeout_ms, reuse_strategy,
                   max_concurrent, idle_ttl_ms, max_restarts, init_params
            FROM mcp_service_stdio
            WHERE server_id = $1
            ",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;

        let reuse: String = row.try_get("reuse_strategy")?;
        let idle_ttl_ms: i64 = row.try_get("idle_ttl_ms")?;
        Ok(StdioConfig {
            server_id: row.try_get("server_id")?,
            command: row.try_get("command")?,
            args: row.try_get::<Vec<String>, _>("args")?,
            workdir: row.try_get("workdir")?,
            env: string_map(row.try_get::<Option<Value>, _>("env")?),
            startup_timeout: Self::ms_or(
                row.try_get("startup_timeout_ms")?,
                self.defaults.default_connect_timeout(),
            ),
            shutdown_timeout: Self::ms_or(
                row.try_get("shutdown_timeout_ms")?,
                self.defaults.default_timeout(),
            ),
            reuse_strategy: ReuseStrategy::parse(&reuse),
            max_concurrent: row.try_get::<i32, _>("max_concurrent")?.max(0) as u32,
            idle_ttl: (idle_ttl_ms > 0).then(|| Duration::from_millis(idle_ttl_ms as u64)),
            max_restarts: row.try_get::<i32, _>("max_restarts")?.max(0) as u32,
            init_params: json_object(row.try_get::<Option<Value>, _>("init_params")?),
        })
    }

    async fn sse_config(&self, server_id: &str) -> Result<SseConfig> {
        let row = sqlx::query(
            r"
            SELECT server_id, base_url, sse_path, auth_type, auth_config,
                   timeout_ms, connect_timeout_ms, retry_attempts, retry_delay_ms,
                   headers, query_params, follow_redirects, max_redirects, user_agent
            FROM mcp_service_sse
            WHERE server_id = $1
            ",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;

        let auth_type: String = row.try_get("auth_type")?;
        let auth_config = json_object(row.try_get::<Option<Value>, _>("auth_config")?);
        let user_agent: String = row.try_get("user_agent")?;
        Ok(SseConfig {
            server_id: row.try_get("server_id")?,
            base_url: row.try_get("base_url")?,
            sse_path: row.try_get("sse_path")?,
            auth: UpstreamAuth::from_parts(&auth_type, auth_config.as_ref()),
            timeout: Self::ms_or(row.try_get("timeout_ms")?, self.defaults.default_timeout()),
            connect_timeout: Self::ms_or(
                row.try_get("connect_timeout_ms")?,
                self.defaults.default_connect_timeout(),
            ),
            retry_attempts: row.try_get::<i32, _>("retry_attempts")?.max(0) as u32,
            retry_delay: Self::ms_or(
                row.try_get("retry_delay_ms")?,
                self.defaults.default_retry_delay(),
            ),
            headers: string_map(row.try_get::<Option<Value>, _>("headers")?),
            query_params: string_map(row.try_get::<Option<Value>, _>("query_params")?),
            follow_redirects: row.try_get("follow_redirects")?,
            max_redirects: row.try_get::<i32, _>("max_redirects")?.max(0) as u32,
            user_agent: (!user_agent.is_empty()).then_some(user_agent),
        })
    }

    async fn is_remote_stdio(&self, server_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS(
                SELECT 1 FROM mcp_service
                WHERE server_id = $1 AND adapter = 'remote_stdio' AND enabled = true
            )
            ",
        )
        .bind(server_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn is_remote_sse(&self, server_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS(
                SELECT 1 FROM mcp_service
                WHERE server_id = $1 AND adapter = 'remote_sse' AND enabled = true
            )
            ",
        )
        .bind(server_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn employee_by_name(&self, name: &str) -> Result<Option<Employee>> {
        let row = sqlx::query(
            r"
            SELECT id, name, address, phone, enabled
            FROM employees
            WHERE name = $1 AND enabled = true
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Employee {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                address: row.try_get("address")?,
                phone: row.try_get("phone")?,
                enabled: row.try_get("enabled")?,
            })
        })
        .transpose()
    }
}

// ============================================================================
// In-memory catalog
// ============================================================================

/// Catalog backed by in-memory maps. Used by the test suite and useful for
/// wiring a gateway without a database.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryCatalogInner>,
}

#[derive(Default)]
struct MemoryCatalogInner {
    services: HashMap<String, ServerDescriptor>,
    tools: HashMap<String, Vec<ToolDescriptor>>,
    stdio: HashMap<String, StdioConfig>,
    sse: HashMap<String, SseConfig>,
    employees: HashMap<String, Employee>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, service: ServerDescriptor) -> &Self {
        self.inner
            .write()
            .services
            .insert(service.server_id.clone(), service);
        self
    }

    pub fn add_tool(&self, tool: ToolDescriptor) -> &Self {
        self.inner
            .write()
            .tools
            .entry(tool.server_id.clone())
            .or_default()
            .push(tool);
        self
    }

    pub fn add_stdio_config(&self, config: StdioConfig) -> &Self {
        self.inner
            .write()
            .stdio
            .insert(config.server_id.clone(), config);
        self
    }

    pub fn add_sse_config(&self, config: SseConfig) -> &Self {
        self.inner
            .write()
            .sse
            .insert(config.server_id.clone(), config);
        self
    }

    pub fn add_employee(&self, employee: Employee) -> &Self {
        self.inner
            .write()
            .employees
            .insert(employee.name.clone(), employee);
        self
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn enabled_builtin_services(&self) -> Result<Vec<ServerDescriptor>> {
        let inner = self.inner.read();
        let mut services: Vec<ServerDescriptor> = inner
            .services
            .values()
            .filter(|s| s.enabled && s.adapter == AdapterKind::Builtin)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(services)
    }

    async fn service(&self, server_id: &str) -> Result<Option<ServerDescriptor>> {
        Ok(self.inner.read().services.get(server_id).cloned())
    }

    async fn enabled_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>> {
        Ok(self
            .inner
            .read()
            .tools
            .get(server_id)
            .map(|tools| tools.iter().filter(|t| t.enabled).cloned().collect())
            .unwrap_or_default())
    }

    async fn stdio_config(&self, server_id: &str) -> Result<StdioConfig> {
        self.inner
            .read()
            .stdio
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))
    }

    async fn sse_config(&self, server_id: &str) -> Result<SseConfig> {
        self.inner
            .read()
            .sse
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))
    }

    async fn is_remote_stdio(&self, server_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .services
            .get(server_id)
            .is_some_and(|s| s.enabled && s.adapter == AdapterKind::RemoteStdio))
    }

    async fn is_remote_sse(&self, server_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .services
            .get(server_id)
            .is_some_and(|s| s.enabled && s.adapter == AdapterKind::RemoteSse))
    }

    async fn employee_by_name(&self, name: &str) -> Result<Option<Employee>> {
        Ok(self
            .inner
            .read()
            .employees
            .get(name)
            .filter(|e| e.enabled)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, adapter: AdapterKind) -> ServerDescriptor {
        ServerDescriptor {
            server_id: id.to_string(),
            display_name: id.to_string(),
            adapter,
            enabled: true,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn memory_catalog_classifies_adapters() {
        let catalog = MemoryCatalog::new();
        catalog.add_service(descriptor("svc_builtin", AdapterKind::Builtin));
        catalog.add_service(descriptor("svc_stdio", AdapterKind::RemoteStdio));
        catalog.add_service(descriptor("svc_sse", AdapterKind::RemoteSse));

        assert!(catalog.is_remote_stdio("svc_stdio").await.unwrap());
        assert!(!catalog.is_remote_stdio("svc_builtin").await.unwrap());
        assert!(catalog.is_remote_sse("svc_sse").await.unwrap());
        assert!(!catalog.is_remote_sse("svc_stdio").await.unwrap());
        assert!(!catalog.is_remote_sse("unknown").await.unwrap());

        let builtins = catalog.enabled_builtin_services().await.unwrap();
        assert_eq!(builtins.len(), 1);
        assert_eq!(builtins[0].server_id, "svc_builtin");
    }

    #[tokio::test]
    async fn memory_catalog_filters_disabled_tools() {
        let catalog = MemoryCatalog::new();
        catalog.add_tool(ToolDescriptor {
            server_id: "svc".into(),
            name: "on".into(),
            description: String::new(),
            args_schema: None,
            enabled: true,
            handler_type: "builtin_echo".into(),
        });
        catalog.add_tool(ToolDescriptor {
            server_id: "svc".into(),
            name: "off".into(),
            description: String::new(),
            args_schema: None,
            enabled: false,
            handler_type: "builtin_echo".into(),
        });

        let tools = catalog.enabled_tools("svc").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "on");
    }

    #[tokio::test]
    async fn missing_configs_surface_server_not_found() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.stdio_config("nope").await,
            Err(GatewayError::ServerNotFound(_))
        ));
        assert!(matches!(
            catalog.sse_config("nope").await,
            Err(GatewayError::ServerNotFound(_))
        ));
    }
}
