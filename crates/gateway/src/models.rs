//! Catalog data model: server descriptors, per-adapter configs, tools.

use chrono::{DateTime, Utc};
use rmcp::model::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// The kind of upstream backing a `server_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Builtin,
    RemoteStdio,
    RemoteSse,
}

impl AdapterKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(AdapterKind::Builtin),
            "remote_stdio" => Some(AdapterKind::RemoteStdio),
            "remote_sse" => Some(AdapterKind::RemoteSse),
            _ => None,
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Builtin => write!(f, "builtin"),
            AdapterKind::RemoteStdio => write!(f, "remote_stdio"),
            AdapterKind::RemoteSse => write!(f, "remote_sse"),
        }
    }
}

/// One registered tool server. Immutable for the life of a gateway run.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDescriptor {
    pub server_id: String,
    pub display_name: String,
    pub adapter: AdapterKind,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonObject>,
}

/// A tool row for a built-in server. `handler_type` selects the in-process
/// implementation from the handler registry.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub args_schema: Option<JsonObject>,
    pub enabled: bool,
    pub handler_type: String,
}

/// Process reuse policy for stdio upstreams. Affects only session-key
/// derivation and the idle-sweep predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseStrategy {
    #[default]
    Shared,
    PerUser,
    PerSession,
    Singleton,
    PerRequest,
}

impl ReuseStrategy {
    /// Parse the catalog's strategy string; anything unrecognized behaves as
    /// `shared`.
    pub fn parse(s: &str) -> Self {
        match s {
            "per_user" => ReuseStrategy::PerUser,
            "per_session" => ReuseStrategy::PerSession,
            "singleton" => ReuseStrategy::Singleton,
            "per_request" => ReuseStrategy::PerRequest,
            _ => ReuseStrategy::Shared,
        }
    }
}

impl fmt::Display for ReuseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReuseStrategy::Shared => write!(f, "shared"),
            ReuseStrategy::PerUser => write!(f, "per_user"),
            ReuseStrategy::PerSession => write!(f, "per_session"),
            ReuseStrategy::Singleton => write!(f, "singleton"),
            ReuseStrategy::PerRequest => write!(f, "per_request"),
        }
    }
}

/// Launch configuration for a `remote_stdio` server.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<String>,
    /// Environment overlay applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub reuse_strategy: ReuseStrategy,
    /// 0 = unbounded.
    pub max_concurrent: u32,
    pub idle_ttl: Option<Duration>,
    /// Spawn budget for one session key within a rolling window. 0 = unbounded.
    pub max_restarts: u32,
    pub init_params: Option<JsonObject>,
}

/// Upstream authentication for remote SSE servers.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum UpstreamAuth {
    #[default]
    None,
    BearerToken {
        token: String,
    },
    ApiKey {
        key: String,
        header: Option<String>,
    },
    /// Every string entry of the parameter bag becomes a request header.
    CustomHeaders(HashMap<String, String>),
}

impl UpstreamAuth {
    /// Build from the catalog's `auth_type` string plus its free-form
    /// parameter bag.
    pub fn from_parts(auth_type: &str, params: Option<&JsonObject>) -> Self {
        let get = |key: &str| -> Option<String> {
            params
                .and_then(|p| p.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match auth_type {
            "bearer_token" => match get("token") {
                Some(token) => UpstreamAuth::BearerToken { token },
                None => UpstreamAuth::None,
            },
            "api_key" => match get("key") {
                Some(key) => UpstreamAuth::ApiKey {
                    key,
                    header: get("header"),
                },
                None => UpstreamAuth::None,
            },
            "custom_header" => {
                let headers: HashMap<String, String> = params
                    .map(|p| {
                        p.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                UpstreamAuth::CustomHeaders(headers)
            }
            _ => UpstreamAuth::None,
        }
    }

    /// Inject the configured credentials into an outgoing header map.
    pub fn apply(&self, headers: &mut reqwest::header::HeaderMap) {
        use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
        match self {
            UpstreamAuth::None => {}
            UpstreamAuth::BearerToken { token } => {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, v);
                }
            }
            UpstreamAuth::ApiKey { key, header } => {
                let name = header.as_deref().unwrap_or("X-API-Key");
                if let Ok(n) = HeaderName::from_bytes(name.as_bytes())
                    && let Ok(v) = HeaderValue::from_str(key)
                {
                    headers.insert(n, v);
                }
            }
            UpstreamAuth::CustomHeaders(map) => {
                for (name, value) in map {
                    if let Ok(n) = HeaderName::from_bytes(name.as_bytes())
                        && let Ok(v) = HeaderValue::from_str(value)
                    {
                        headers.insert(n, v);
                    }
                }
            }
        }
    }
}

/// Connection configuration for a `remote_sse` server.
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub server_id: String,
    pub base_url: String,
    pub sse_path: String,
    pub auth: UpstreamAuth,
    /// Per-request timeout (POST forwarding and tool calls).
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Default headers prepended on every upstream request.
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub user_agent: Option<String>,
}

/// An employee record from the catalog database, served by the
/// database-backed built-in tools.
#[derive(Debug, Clone, Serialize)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub enabled: bool,
}

/// The gateway's per-client-session record.
///
/// `sse_config == None` marks a session routed to a local protocol-SSE
/// handler; `Some` marks a transparent-proxied remote SSE session.
#[derive(Debug, Clone, Serialize)]
pub struct HttpSession {
    pub server_id: String,
    pub session_id: String,
    #[serde(skip)]
    pub sse_config: Option<SseConfig>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
    pub connection_id: String,
}

impl HttpSession {
    pub fn new(server_id: String, session_id: String, sse_config: Option<SseConfig>) -> Self {
        let now = Utc::now();
        Self {
            server_id,
            session_id,
            sse_config,
            created_at: now,
            last_used: now,
            is_active: true,
            connection_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
        }
    }
}

/// Convert a stored JSON argument-schema record into the structured input
/// schema advertised over the protocol: type, title, description, per-property
/// type/description, and the required list. Unknown keys are dropped.
pub fn input_schema_from_args(args: &JsonObject) -> JsonObject {
    let mut schema = JsonObject::new();

    for key in ["type", "title", "description"] {
        if let Some(s) = args.get(key).and_then(Value::as_str) {
            schema.insert(key.to_string(), Value::String(s.to_string()));
        }
    }

    if let Some(props) = args.get("properties").and_then(Value::as_object) {
        let mut out = JsonObject::new();
        for (name, prop) in props {
            let Some(prop) = prop.as_object() else {
                continue;
            };
            let mut p = JsonObject::new();
            for key in ["type", "description"] {
                if let Some(s) = prop.get(key).and_then(Value::as_str) {
                    p.insert(key.to_string(), Value::String(s.to_string()));
                }
            }
            out.insert(name.clone(), Value::Object(p));
        }
        schema.insert("properties".to_string(), Value::Object(out));
    }

    if let Some(required) = args.get("required").and_then(Value::as_array) {
        let list: Vec<Value> = required.iter().filter(|v| v.is_string()).cloned().collect();
        schema.insert("required".to_string(), Value::Array(list));
    }

    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reuse_strategy_parses_known_values_and_defaults_to_shared() {
        assert_eq!(ReuseStrategy::parse("per_user"), ReuseStrategy::PerUser);
        assert_eq!(ReuseStrategy::parse("per_session"), ReuseStrategy::PerSession);
        assert_eq!(ReuseStrategy::parse("singleton"), ReuseStrategy::Singleton);
        assert_eq!(ReuseStrategy::parse("per_request"), ReuseStrategy::PerRequest);
        assert_eq!(ReuseStrategy::parse("shared"), ReuseStrategy::Shared);
        assert_eq!(ReuseStrategy::parse(""), ReuseStrategy::Shared);
        assert_eq!(ReuseStrategy::parse("bogus"), ReuseStrategy::Shared);
    }

    #[test]
    fn auth_from_parts_builds_each_variant() {
        let bag = json!({"token": "t0ken"});
        assert_eq!(
            UpstreamAuth::from_parts("bearer_token", bag.as_object()),
            UpstreamAuth::BearerToken {
                token: "t0ken".into()
            }
        );

        let bag = json!({"key": "k", "header": "X-Custom-Key"});
        assert_eq!(
            UpstreamAuth::from_parts("api_key", bag.as_object()),
            UpstreamAuth::ApiKey {
                key: "k".into(),
                header: Some("X-Custom-Key".into())
            }
        );

        let bag = json!({"X-A": "1", "X-B": "2", "ignored": 3});
        let UpstreamAuth::CustomHeaders(map) =
            UpstreamAuth::from_parts("custom_header", bag.as_object())
        else {
            panic!("expected custom headers");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(map["X-A"], "1");

        assert_eq!(UpstreamAuth::from_parts("none", None), UpstreamAuth::None);
        // Missing parameters degrade to no auth rather than erroring.
        assert_eq!(
            UpstreamAuth::from_parts("bearer_token", None),
            UpstreamAuth::None
        );
    }

    #[test]
    fn auth_apply_sets_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        UpstreamAuth::BearerToken {
            token: "abc".into(),
        }
        .apply(&mut headers);
        assert_eq!(headers["authorization"], "Bearer abc");

        let mut headers = reqwest::header::HeaderMap::new();
        UpstreamAuth::ApiKey {
            key: "k".into(),
            header: None,
        }
        .apply(&mut headers);
        assert_eq!(headers["x-api-key"], "k");
    }

    #[test]
    fn input_schema_keeps_structured_fields_only() {
        let args = json!({
            "type": "object",
            "title": "echo args",
            "description": "echo a string",
            "x-vendor": {"drop": true},
            "properties": {
                "text": {"type": "string", "description": "text to echo", "minLength": 1},
                "prefix": {"type": "string"}
            },
            "required": ["text", 42]
        });
        let schema = input_schema_from_args(args.as_object().unwrap());

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["title"], "echo args");
        assert!(schema.get("x-vendor").is_none());
        let props = schema["properties"].as_object().unwrap();
        assert_eq!(props["text"]["type"], "string");
        assert_eq!(props["text"]["description"], "text to echo");
        // Nested constraint keys are not part of the structured conversion.
        assert!(props["text"].get("minLength").is_none());
        assert_eq!(schema["required"], json!(["text"]));
    }
}
