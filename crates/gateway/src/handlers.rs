//! In-process tool handler registry.
//!
//! Built-in servers resolve a tool's `handler_type` string against this
//! registry. Handlers are opaque async functions from an argument bag to a
//! protocol result; errors are reported through the result's error flag, not
//! as protocol failures.

use crate::catalog::Catalog;
use crate::tool_server::ToolCallFn;
use rmcp::model::{CallToolResult, Content, JsonObject};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct HandlerRegistry {
    handlers: HashMap<String, ToolCallFn>,
}

fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn error_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text.into())])
}

fn arg_str(args: &JsonObject, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl HandlerRegistry {
    /// Create a registry with the built-in handler set registered. The
    /// database-backed handlers read through the given catalog.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_builtin_handlers(catalog);
        registry
    }

    pub fn register(&mut self, handler_type: impl Into<String>, handler: ToolCallFn) {
        self.handlers.insert(handler_type.into(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<ToolCallFn> {
        self.handlers.get(handler_type).cloned()
    }

    fn register_builtin_handlers(&mut self, catalog: Arc<dyn Catalog>) {
        self.register(
            "builtin_echo",
            Arc::new(|args: JsonObject| {
                Box::pin(async move {
                    let Some(mut text) = arg_str(&args, "text") else {
                        return Ok(error_result("Error: 'text' parameter is required"));
                    };
                    if let Some(prefix) = arg_str(&args, "prefix") {
                        text = format!("{prefix} {text}");
                    }
                    Ok(text_result(text))
                })
            }),
        );

        self.register(
            "builtin_greet",
            Arc::new(|args: JsonObject| {
                Box::pin(async move {
                    let name = arg_str(&args, "name").unwrap_or_else(|| "World".to_string());
                    let greeting =
                        arg_str(&args, "greeting").unwrap_or_else(|| "Hello".to_string());
                    Ok(text_result(format!("{greeting}, {name}!")))
                })
            }),
        );

        self.register(
            "builtin_say_hi",
            Arc::new(|args: JsonObject| {
                Box::pin(async move {
                    Ok(match arg_str(&args, "name") {
                        Some(name) => text_result(format!("Hi {name}!")),
                        None => text_result("Hi there!"),
                    })
                })
            }),
        );

        self.register(
            "builtin_status",
            Arc::new(|_args: JsonObject| {
                Box::pin(async move { Ok(text_result("System is running normally")) })
            }),
        );

        self.register(
            "builtin_employee_query",
            employee_handler(catalog.clone(), |e| {
                format!(
                    "Employee info:\nName: {}\nAddress: {}\nPhone: {}",
                    e.name, e.address, e.phone
                )
            }),
        );

        self.register(
            "builtin_employee_address",
            employee_handler(catalog.clone(), |e| {
                format!("Address of {}: {}", e.name, e.address)
            }),
        );

        self.register(
            "builtin_employee_phone",
            employee_handler(catalog, |e| format!("Phone of {}: {}", e.name, e.phone)),
        );

        // Prefix handlers kept for existing catalog rows.
        self.register("say_hi", legacy_prefix_handler("Hi"));
        self.register("say_hello", legacy_prefix_handler("Hello"));
        self.register("say_notfond", legacy_prefix_handler("NotFond"));
    }
}

/// Build a handler that looks an employee up by the `name` argument and
/// formats the record.
fn employee_handler(
    catalog: Arc<dyn Catalog>,
    format: fn(&crate::models::Employee) -> String,
) -> ToolCallFn {
    Arc::new(move |args: JsonObject| {
        let catalog = catalog.clone();
        Box::pin(async move {
            let Some(name) = arg_str(&args, "name") else {
                return Ok(error_result("Error: 'name' parameter is required"));
            };
            match catalog.employee_by_name(&name).await {
                Ok(Some(employee)) => Ok(text_result(format(&employee))),
                Ok(None) => Ok(text_result(format!("Employee '{name}' not found"))),
                Err(e) => Ok(error_result(format!("Error querying employee: {e}"))),
            }
        })
    })
}

fn legacy_prefix_handler(prefix: &'static str) -> ToolCallFn {
    Arc::new(move |args: JsonObject| {
        Box::pin(async move {
            let name = arg_str(&args, "name").unwrap_or_else(|| "Anonymous".to_string());
            Ok(text_result(format!("{prefix} {name}")))
        })
    })
}
