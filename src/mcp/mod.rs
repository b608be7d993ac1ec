//! Model Context Protocol (MCP) client subsystem.
//!
//! Connects to external tool servers over stdio or HTTP, discovers their
//! tools, resources, and prompts, and executes tool calls on behalf of the
//! tool loop.
//!
//! # Configuration
//!
//! Servers are declared in an `mcp.json` file:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": {
//!       "command": "npx",
//!       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//!     },
//!     "search": {
//!       "url": "https://search.example.com/mcp",
//!       "headers": { "Authorization": "Bearer ${SEARCH_API_KEY}" },
//!       "timeout_secs": 10
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Namespacing
//!
//! Tools are exposed as `mcp.<server>.<tool>` (e.g. `mcp.files.read`), so two
//! servers may both offer a `read` tool without colliding.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod uri;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{Catalog, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
pub use client::McpClient;
pub use config::McpServerConfig;
pub use error::{McpError, McpResult};
pub use health::{HealthConfig, HealthMonitor};
pub use manager::{RetryPolicy, ServerConnection, ServerInfo, ServerManager, ServerStatus};
pub use pool::{ConnectionPool, PoolConfig};
pub use transport::{Transport, TransportKind};
