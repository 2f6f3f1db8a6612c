//! In-process protocol server: a named collection of tools with call dispatch.
//!
//! A `ToolServer` backs all three adapter kinds. Built-in servers register
//! wrappers around in-process handlers; stdio and SSE upstream managers
//! register proxy handlers that forward to a remote client session.

use futures::future::BoxFuture;
use rmcp::model::{CallToolResult, ErrorData, JsonObject, Tool};
use std::collections::HashMap;
use std::sync::Arc;

pub type ToolCallFuture = BoxFuture<'static, Result<CallToolResult, ErrorData>>;
pub type ToolCallFn = Arc<dyn Fn(JsonObject) -> ToolCallFuture + Send + Sync>;

#[derive(Clone)]
pub struct ToolServer {
    name: String,
    tools: Vec<Tool>,
    handlers: HashMap<String, ToolCallFn>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a tool. A later registration under the same name replaces the
    /// earlier handler.
    pub fn add_tool(&mut self, tool: Tool, handler: ToolCallFn) {
        let name = tool.name.to_string();
        if self.handlers.insert(name, handler).is_some() {
            self.tools.retain(|t| t.name != tool.name);
        }
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<CallToolResult, ErrorData> {
        let Some(handler) = self.handlers.get(name) else {
            return Err(ErrorData::invalid_params(
                format!("unknown tool '{name}'"),
                None,
            ));
        };
        handler(arguments).await
    }
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .finish()
    }
}
