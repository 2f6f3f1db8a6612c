//! Built-in server factory.
//!
//! Assembles a `ToolServer` for a catalog service with `adapter = builtin`:
//! fetches its enabled tools, resolves each `handler_type` against the
//! handler registry, and registers the handler under the converted input
//! schema. Tools with an unresolved handler type are skipped with a warning.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::models::{ServerDescriptor, input_schema_from_args};
use crate::tool_server::ToolServer;
use rmcp::model::{JsonObject, Tool};
use std::collections::HashMap;
use std::sync::Arc;

pub async fn build_builtin_server(
    catalog: &Arc<dyn Catalog>,
    registry: &HandlerRegistry,
    service: &ServerDescriptor,
) -> Result<ToolServer> {
    let mut server = ToolServer::new(service.server_id.clone());

    for tool in catalog.enabled_tools(&service.server_id).await? {
        let Some(handler) = registry.get(&tool.handler_type) else {
            tracing::warn!(
                server_id = %service.server_id,
                tool = %tool.name,
                handler_type = %tool.handler_type,
                "no handler found for type; skipping tool"
            );
            continue;
        };

        let input_schema = tool
            .args_schema
            .as_ref()
            .map(input_schema_from_args)
            .unwrap_or_else(JsonObject::new);

        tracing::debug!(server_id = %service.server_id, tool = %tool.name, "adding tool");
        server.add_tool(
            Tool::new(tool.name.clone(), tool.description.clone(), Arc::new(input_schema)),
            handler,
        );
    }

    Ok(server)
}

/// Load every enabled built-in service from the catalog. A service that fails
/// to build is skipped rather than failing startup.
pub async fn load_builtin_servers(
    catalog: &Arc<dyn Catalog>,
    registry: &HandlerRegistry,
) -> Result<HashMap<String, ToolServer>> {
    let services = catalog.enabled_builtin_services().await?;
    tracing::info!("Loading {} builtin service(s) from catalog", services.len());

    let mut servers = HashMap::new();
    for service in &services {
        match build_builtin_server(catalog, registry, service).await {
            Ok(server) => {
                tracing::info!(
                    server_id = %service.server_id,
                    tools = server.tools().len(),
                    "loaded builtin service"
                );
                servers.insert(service.server_id.clone(), server);
            }
            Err(e) => {
                tracing::warn!(server_id = %service.server_id, error = %e, "failed to build builtin service");
            }
        }
    }
    Ok(servers)
}
