//! Bidirectional runtime for the Model Context Protocol (MCP).
//!
//! A client (typically an LLM host) and a server (a tool/resource
//! provider) exchange JSON-RPC 2.0 requests, responses, and
//! notifications to list and invoke tools, read resources, render
//! prompts, stream log events, solicit user input, request filesystem
//! roots, and manage long-running asynchronous tasks.
//!
//! The crate centers on the server runtime:
//!
//! - [`server::Server`] -- registries, session table, dispatch, hooks
//! - [`server::session`] -- per-connection state and capability mix-ins
//! - [`server::http::StreamableHttpServer`] -- the single-endpoint
//!   streaming HTTP transport (JSON replies, SSE upgrades, DELETE
//!   termination)
//! - [`server::tasks::TaskManager`] -- asynchronous task-augmented tool
//!   calls with cancellation, concurrency limits, and TTL retirement
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_runtime::server::http::{StreamableHttpConfig, StreamableHttpServer};
//! use mcp_runtime::server::{RequestContext, Server, ToolHandler};
//! use mcp_runtime::types::{CallToolParams, CallToolResult, Tool};
//! use mcp_runtime::Result;
//!
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl ToolHandler for Greet {
//!     async fn handle(
//!         &self,
//!         _ctx: RequestContext,
//!         params: CallToolParams,
//!     ) -> Result<CallToolResult> {
//!         let name = params.arguments["name"].as_str().unwrap_or("world");
//!         Ok(CallToolResult::text(format!("hello, {name}")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::builder()
//!         .name("greeter")
//!         .version("1.0.0")
//!         .tool(
//!             Tool::new("greet", "Say hello", serde_json::json!({"type": "object"})),
//!             Arc::new(Greet),
//!         )
//!         .build();
//!
//!     let http = StreamableHttpServer::with_config(
//!         "127.0.0.1:8080".parse().unwrap(),
//!         server,
//!         StreamableHttpConfig::stateful(),
//!     );
//!     let addr = http.start().await?;
//!     println!("listening on {addr}");
//!     futures_util::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod server;
pub mod types;
pub mod uri_template;

pub use error::{Error, Result};
pub use server::http::{StreamableHttpConfig, StreamableHttpServer};
pub use server::{RequestContext, Server, ServerBuilder};
pub use types::{
    CallToolParams, CallToolResult, ClientCapabilities, Content, Implementation, JSONRPCError,
    JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, RequestId, ServerCapabilities, Task,
    TaskStatus, Tool,
};

/// Protocol versions this build speaks, oldest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2024-11-05", "2025-03-26", "2025-06-18", "2025-11-25"];

/// The newest protocol version this build speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// The version assumed when a client omits `protocolVersion`, for
/// compatibility with pre-negotiation clients.
pub const DEFAULT_NEGOTIATED_VERSION: &str = "2025-03-26";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_is_the_last_supported_version() {
        assert_eq!(
            SUPPORTED_PROTOCOL_VERSIONS.last().copied(),
            Some(LATEST_PROTOCOL_VERSION)
        );
    }

    #[test]
    fn default_version_is_supported() {
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&DEFAULT_NEGOTIATED_VERSION));
    }
}
