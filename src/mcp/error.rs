use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the MCP client subsystem.
pub type McpResult<T> = Result<T, McpError>;

/// Failures surfaced by transports, clients, and the server manager.
///
/// The variants map one-to-one onto how the rest of the gateway reacts:
/// connection failures degrade a server, protocol and timeout failures fail
/// a single call, and tool or policy failures become content for the model.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server unreachable, process died, or the HTTP exchange failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server sent something that is not a valid MCP message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived before the deadline.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The remote tool ran and reported a failure.
    #[error("tool error: {0}")]
    Tool(String),

    /// A guardrail blocked the call before it reached a server.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Unknown server, tool, or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport variant that exists only as an interface.
    #[error("{0} not yet implemented")]
    NotImplemented(&'static str),

    /// Every pooled connection for the server stayed busy until the acquire deadline.
    #[error("connection pool exhausted for server '{0}'")]
    PoolExhausted(String),

    /// The transport was closed locally.
    #[error("transport closed")]
    Closed,

    /// JSON-RPC error object returned by the server.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl McpError {
    /// Stable machine-readable label, used in tool result payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Protocol(_) => "protocol_error",
            Self::Timeout(_) => "timeout",
            Self::Tool(_) => "tool_error",
            Self::PolicyDenied(_) => "policy_denied",
            Self::NotFound(_) => "not_found",
            Self::NotImplemented(_) => "not_implemented",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Closed => "closed",
            Self::Rpc { .. } => "rpc_error",
        }
    }

    /// Whether the failure says something about the server's reachability
    /// rather than about one call.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }

    pub(crate) fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}
