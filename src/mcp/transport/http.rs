use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use url::Url;

use super::{RequestContext, Transport, TransportKind};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::pool::{ConnectionPool, PooledConnection};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

/// JSON-RPC over plain HTTP POST, one message per request, using clients
/// checked out of the shared [`ConnectionPool`].
#[derive(Debug)]
pub struct HttpTransport {
    server_name: String,
    url: Url,
    headers: HashMap<String, String>,
    pool: Arc<ConnectionPool>,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        server_name: String,
        url: &str,
        headers: HashMap<String, String>,
        pool: Arc<ConnectionPool>,
    ) -> McpResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| McpError::Connection(format!("invalid url for '{server_name}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::Connection(format!(
                "unsupported scheme '{}' for '{server_name}'",
                url.scheme()
            )));
        }
        Ok(Self {
            server_name,
            url,
            headers,
            pool,
            closed: AtomicBool::new(true),
        })
    }

    async fn post(
        &self,
        conn: &PooledConnection,
        message: &JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<reqwest::Response> {
        let mut req = conn
            .client()
            .post(self.url.clone())
            .timeout(ctx.timeout)
            .json(message);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        if let Some(request_id) = &ctx.request_id {
            req = req.header("X-Request-ID", request_id);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout(ctx.timeout)
            } else {
                McpError::Connection(format!("POST {} failed: {e}", self.url))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Connection(format!(
                "server '{}' returned HTTP {status}: {body}",
                self.server_name
            )));
        }
        Ok(resp)
    }

    async fn exchange(
        &self,
        conn: &PooledConnection,
        message: &JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse> {
        let resp = self.post(conn, message, ctx).await?;
        let body = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout(ctx.timeout)
            } else {
                McpError::Connection(format!("failed reading response body: {e}"))
            }
        })?;
        let parsed: JsonRpcResponse = serde_json::from_slice(&body)
            .map_err(|e| McpError::Protocol(format!("invalid JSON-RPC response: {e}")))?;

        if parsed.id_u64() != message.id {
            tracing::warn!(
                server = %self.server_name,
                expected = ?message.id,
                received = ?parsed.id,
                "JSON-RPC response id mismatch"
            );
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> McpResult<()> {
        // Connections are opened lazily per request by the pool.
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcRequest) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let conn = self.pool.acquire(&self.server_name).await?;
        let ctx = RequestContext::new(self.pool.config().acquire_timeout);
        self.post(&conn, &message, &ctx).await?;
        self.pool.release(conn);
        Ok(())
    }

    async fn request(
        &self,
        message: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let conn = self.pool.acquire(&self.server_name).await?;

        let result = match tokio::time::timeout(ctx.timeout, self.exchange(&conn, &message, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(ctx.timeout)),
        };

        // A client that just failed to reach the server is not worth keeping.
        match &result {
            Err(e) if e.is_connection_failure() => drop(conn),
            _ => self.pool.release(conn),
        }
        result
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
