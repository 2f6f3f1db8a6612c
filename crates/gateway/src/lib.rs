//! Multiplexing gateway for MCP tool servers.
//!
//! Clients speak MCP over SSE to this gateway; each logical session is routed
//! to one of several backing tool servers selected by `server_id`:
//! tools served in-process against the catalog database (`builtin`), child
//! processes spoken to over stdio (`remote_stdio`), or remote SSE endpoints
//! proxied transparently (`remote_sse`).

pub mod app;
pub mod auth;
pub mod builtin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod sse_proxy;
pub mod sse_transport;
pub mod tool_server;
pub mod upstream;
