//! Message exchange with a single tool server.
//!
//! Every variant implements [`Transport`]; the client above it never knows
//! whether it is talking to a child process or an HTTP endpoint.
//!
//! - [`StdioTransport`]: newline-delimited JSON over a child's stdin/stdout
//! - [`HttpTransport`]: one POST per message through the [`ConnectionPool`]
//! - [`SseTransport`]: interface only, fails on connect

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::config::McpServerConfig;
use super::error::{McpError, McpResult};
use super::pool::ConnectionPool;
use super::protocol::{JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        };
        f.write_str(s)
    }
}

/// Per-call options threaded from the caller down to the wire.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub timeout: Duration,
    /// Propagated as `X-Request-ID` where the transport supports headers.
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        self.request_id = request_id.map(str::to_string);
        self
    }
}

/// Bidirectional message exchange with one tool server.
///
/// `request` is the correlated send/receive pair: it writes a message that
/// carries an id and resolves with the response bearing the same id, or
/// fails with [`McpError::Timeout`] once `ctx.timeout` elapses.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel. Calling it on an open transport is a no-op.
    async fn connect(&self) -> McpResult<()>;

    /// Fire-and-forget message, used for notifications.
    async fn send(&self, message: JsonRpcRequest) -> McpResult<()>;

    async fn request(
        &self,
        message: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse>;

    async fn close(&self) -> McpResult<()>;

    fn is_closed(&self) -> bool;
}

/// Builds the transport variant named by the server's configuration.
pub fn build_transport(
    config: &McpServerConfig,
    pool: &Arc<ConnectionPool>,
) -> McpResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Stdio => {
            let command = config.command.clone().ok_or_else(|| {
                McpError::Connection(format!("server '{}' has no command", config.name))
            })?;
            Arc::new(StdioTransport::new(
                config.name.clone(),
                command,
                config.args.clone(),
                config.env.clone(),
            ))
        }
        TransportKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                McpError::Connection(format!("server '{}' has no url", config.name))
            })?;
            Arc::new(HttpTransport::new(
                config.name.clone(),
                url,
                config.headers.clone(),
                Arc::clone(pool),
            )?)
        }
        TransportKind::Sse => Arc::new(SseTransport::new(
            config.name.clone(),
            config.url.clone().unwrap_or_default(),
        )),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::pool::PoolConfig;

    #[test]
    fn test_kind_serde_is_lowercase() {
        let kind: TransportKind = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(kind, TransportKind::Http);
        assert_eq!(TransportKind::Sse.to_string(), "sse");
    }

    #[test]
    fn test_build_transport_picks_variant() {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let stdio = build_transport(&McpServerConfig::stdio("files", "cat", vec![]), &pool).unwrap();
        assert_eq!(stdio.kind(), TransportKind::Stdio);
        assert!(stdio.is_closed());

        let http =
            build_transport(&McpServerConfig::http("search", "http://localhost:9/mcp"), &pool)
                .unwrap();
        assert_eq!(http.kind(), TransportKind::Http);
    }

    #[test]
    fn test_build_http_rejects_bad_url() {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let err = build_transport(&McpServerConfig::http("search", "not a url"), &pool).unwrap_err();
        assert!(matches!(err, McpError::Connection(_)));
    }
}
