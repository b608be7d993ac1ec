//! toolgate
//!
//! An OpenAI-compatible gateway in front of a local Ollama-style backend that
//! lets the model call tools served by external Model Context Protocol servers.
//!
//! # Architecture
//!
//! - **Proxy**: Axum handlers for `/v1/chat/completions`, `/v1/models`, and the
//!   read-only MCP management API
//! - **Tool Loop**: bounded model/tool rounds driven by an explicit state machine
//! - **MCP Client**: stdio and pooled HTTP transports, discovery, health checks
//! - **Cache**: in-memory TTL cache for non-streaming completions
//!
//! # Modules
//!
//! - [`backend`]: inference backend client and wire conversion
//! - [`cache`]: response cache
//! - [`mcp`]: MCP client subsystem
//! - [`proxy`]: HTTP handlers and the tool loop
//! - [`tools`]: guardrails, schema mapping, and tool execution

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod mcp;
pub mod proxy;
pub mod server;
pub mod telemetry;
pub mod tools;

use std::sync::Arc;

use backend::BackendClient;
use cache::ResponseCache;
use config::AppConfig;
use mcp::{HealthMonitor, ServerManager};
use proxy::ToolLoop;
use tools::ToolManager;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Global configuration.
    pub config: Arc<AppConfig>,
    /// Inference backend client.
    pub backend: Arc<BackendClient>,
    /// Every configured MCP server connection.
    pub servers: Arc<ServerManager>,
    /// Guardrailed tool execution.
    pub tools: Arc<ToolManager>,
    pub tool_loop: Arc<ToolLoop>,
    /// Completion cache.
    pub cache: Arc<ResponseCache>,
    pub health: Arc<HealthMonitor>,
}
