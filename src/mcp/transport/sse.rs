use async_trait::async_trait;

use super::{RequestContext, Transport, TransportKind};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

const UNSUPPORTED: &str = "SSE transport";

/// Placeholder for the server-sent-events transport. Every operation that
/// would touch the network fails with [`McpError::NotImplemented`], so a
/// misconfigured server shows up as disconnected instead of silently idle.
#[derive(Debug)]
pub struct SseTransport {
    server_name: String,
    url: String,
}

impl SseTransport {
    pub fn new(server_name: String, url: String) -> Self {
        Self { server_name, url }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> McpResult<()> {
        tracing::warn!(server = %self.server_name, url = %self.url, "SSE transport requested but not available");
        Err(McpError::NotImplemented(UNSUPPORTED))
    }

    async fn send(&self, _message: JsonRpcRequest) -> McpResult<()> {
        Err(McpError::NotImplemented(UNSUPPORTED))
    }

    async fn request(
        &self,
        _message: JsonRpcRequest,
        _ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse> {
        Err(McpError::NotImplemented(UNSUPPORTED))
    }

    async fn close(&self) -> McpResult<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_is_not_implemented() {
        let t = SseTransport::new("events".into(), "http://localhost/sse".into());
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, McpError::NotImplemented(_)));
        assert_eq!(err.to_string(), "SSE transport not yet implemented");
        assert!(t.close().await.is_ok());
    }
}
