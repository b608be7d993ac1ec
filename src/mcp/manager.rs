//! Owner of every tool-server connection.
//!
//! The server map lives behind a `std::sync::RwLock` and is only ever touched
//! briefly: callers clone the `Arc<ServerConnection>` they need and release the
//! lock before any network I/O.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::catalog::{Catalog, ToolDescriptor, split_namespaced};
use super::client::McpClient;
use super::config::McpServerConfig;
use super::error::{McpError, McpResult};
use super::pool::{ConnectionPool, PoolStats};
use super::protocol::{CallToolResult, GetPromptResult, ReadResourceResult};
use super::transport::{Transport, TransportKind, build_transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connecting,
    Healthy,
    Degraded,
    Disconnected,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup connection retry: `attempts` tries, sleeping `initial_backoff`
/// after the first failure and doubling after each one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub calls: u64,
    pub errors: u64,
    pub last_latency_ms: u64,
}

#[derive(Debug, Default)]
struct CallStats {
    calls: AtomicU64,
    errors: AtomicU64,
    last_latency_ms: AtomicU64,
}

#[derive(Debug)]
struct ConnectionState {
    status: ServerStatus,
    last_health_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    catalog: Arc<Catalog>,
}

/// One configured tool server: its client, its discovered catalog, and its
/// health as last observed.
#[derive(Debug)]
pub struct ServerConnection {
    name: String,
    config: McpServerConfig,
    client: McpClient,
    state: RwLock<ConnectionState>,
    stats: CallStats,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ServerConnection {
    pub fn new(config: McpServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: config.name.clone(),
            client: McpClient::new(config.name.clone(), transport, config.timeout),
            config,
            state: RwLock::new(ConnectionState {
                status: ServerStatus::Disconnected,
                last_health_check: None,
                last_error: None,
                catalog: Arc::new(Catalog::default()),
            }),
            stats: CallStats::default(),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.client.transport_kind()
    }

    pub fn status(&self) -> ServerStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .catalog,
        )
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_health_check
    }

    pub fn last_error(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            calls: self.stats.calls.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            last_latency_ms: self.stats.last_latency_ms.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_status(&self, status: ServerStatus, error: Option<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.status != status {
            tracing::info!(server = %self.name, from = ?state.status, to = ?status, "Server status changed");
        }
        state.status = status;
        if error.is_some() || status == ServerStatus::Healthy {
            state.last_error = error;
        }
    }

    pub(crate) fn touch_health_check(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_health_check = Some(Utc::now());
    }

    fn record_call(&self, elapsed: Duration, ok: bool) {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.stats.last_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Connects, handshakes, and discovers. On failure the transport is closed
    /// and the server is left `Disconnected`.
    ///
    /// Attempts are serialized per server. A caller that waited behind a
    /// successful attempt returns without reconnecting.
    pub async fn establish(&self) -> McpResult<()> {
        let _attempt = self.connect_lock.lock().await;
        if self.status() == ServerStatus::Healthy && !self.client.is_closed() {
            return Ok(());
        }

        self.set_status(ServerStatus::Connecting, None);
        let result = async {
            self.client.connect().await?;
            self.client.discover().await
        }
        .await;

        match result {
            Ok(catalog) => {
                self.replace_catalog(catalog);
                self.set_status(ServerStatus::Healthy, None);
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = self.client.close().await {
                    tracing::debug!(server = %self.name, error = %close_err, "Close after failed connect");
                }
                self.set_status(ServerStatus::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Re-runs discovery and swaps the catalog in one step. Tool names depend
    /// only on server and tool names, so surviving tools keep their names.
    pub async fn refresh_catalog(&self) -> McpResult<()> {
        let catalog = self.client.discover().await?;
        self.replace_catalog(catalog);
        Ok(())
    }

    fn replace_catalog(&self, catalog: Catalog) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .catalog = Arc::new(catalog);
    }
}

/// Management view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tools: Vec<String>,
    pub resources: usize,
    pub prompts: usize,
    pub stats: ServerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

#[derive(Debug)]
pub struct ServerManager {
    servers: RwLock<BTreeMap<String, Arc<ServerConnection>>>,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
}

impl ServerManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            servers: RwLock::new(BTreeMap::new()),
            pool,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Adds a server without connecting it.
    pub fn register(
        &self,
        config: McpServerConfig,
        transport: Arc<dyn Transport>,
    ) -> McpResult<Arc<ServerConnection>> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if servers.contains_key(&config.name) {
            return Err(McpError::Connection(format!(
                "server '{}' is already registered",
                config.name
            )));
        }
        let conn = Arc::new(ServerConnection::new(config, transport));
        servers.insert(conn.name.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Registers and connects every enabled server concurrently. A server that
    /// still fails after its retries stays registered as `Disconnected` for the
    /// health monitor to pick up. Returns the number of healthy servers.
    pub async fn connect_all(&self, configs: &[McpServerConfig]) -> usize {
        let mut pending = Vec::new();
        for config in configs {
            if !config.enabled {
                tracing::info!(server = %config.name, "MCP server disabled, skipping");
                continue;
            }
            let registered = build_transport(config, &self.pool)
                .and_then(|transport| self.register(config.clone(), transport));
            match registered {
                Ok(conn) => pending.push(conn),
                Err(e) => {
                    tracing::error!(server = %config.name, error = %e, "Cannot register MCP server");
                }
            }
        }

        let results = join_all(pending.iter().map(|conn| self.connect_with_retry(conn))).await;
        let healthy = results.into_iter().filter(|ok| *ok).count();
        tracing::info!(healthy, total = pending.len(), "MCP servers connected");
        healthy
    }

    async fn connect_with_retry(&self, conn: &ServerConnection) -> bool {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.initial_backoff;
        for attempt in 1..=attempts {
            match conn.establish().await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        server = %conn.name,
                        attempt,
                        attempts,
                        error = %e,
                        "MCP server connection failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        false
    }

    pub fn list_servers(&self) -> Vec<Arc<ServerConnection>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get_server(&self, name: &str) -> McpResult<Arc<ServerConnection>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::NotFound(format!("server '{name}'")))
    }

    /// Every tool on a healthy server, ordered by server name and then by the
    /// order the server listed them.
    pub fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        self.list_servers()
            .iter()
            .filter(|s| s.status() == ServerStatus::Healthy)
            .flat_map(|s| s.catalog().tools.clone())
            .collect()
    }

    /// Maps a namespaced name to its server and descriptor without any I/O.
    pub fn resolve_tool(&self, namespaced: &str) -> McpResult<(Arc<ServerConnection>, ToolDescriptor)> {
        let (server, tool) = split_namespaced(namespaced)
            .ok_or_else(|| McpError::NotFound(format!("tool '{namespaced}'")))?;
        let conn = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::NotFound(format!("tool '{namespaced}'")))?;
        let descriptor = conn
            .catalog()
            .tool(tool)
            .cloned()
            .ok_or_else(|| McpError::NotFound(format!("tool '{namespaced}'")))?;
        Ok((conn, descriptor))
    }

    pub async fn execute_tool(
        &self,
        namespaced: &str,
        arguments: Value,
        timeout: Duration,
        request_id: Option<&str>,
    ) -> McpResult<CallToolResult> {
        let (conn, descriptor) = self.resolve_tool(namespaced)?;
        if conn.status() != ServerStatus::Healthy {
            return Err(McpError::Connection(format!(
                "server '{}' is {:?}",
                conn.name,
                conn.status()
            )));
        }

        let started = Instant::now();
        let result = conn
            .client
            .execute_tool(&descriptor.local_name, arguments, timeout, request_id)
            .await;
        conn.record_call(started.elapsed(), result.is_ok());

        if let Err(e) = &result {
            if e.is_connection_failure() {
                conn.set_status(ServerStatus::Degraded, Some(e.to_string()));
            }
        }
        result
    }

    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        timeout: Duration,
    ) -> McpResult<ReadResourceResult> {
        let conn = self.get_server(server)?;
        if conn.status() != ServerStatus::Healthy {
            return Err(McpError::Connection(format!("server '{server}' is not healthy")));
        }
        conn.client.read_resource(uri, timeout).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> McpResult<GetPromptResult> {
        let conn = self.get_server(server)?;
        if conn.status() != ServerStatus::Healthy {
            return Err(McpError::Connection(format!("server '{server}' is not healthy")));
        }
        conn.client.get_prompt(name, arguments).await
    }

    pub fn server_info(&self, conn: &ServerConnection) -> ServerInfo {
        let catalog = conn.catalog();
        let transport = conn.transport_kind();
        ServerInfo {
            name: conn.name.clone(),
            transport,
            status: conn.status(),
            last_health_check: conn.last_health_check(),
            last_error: conn.last_error(),
            tools: catalog
                .tools
                .iter()
                .map(|t| t.namespaced_name.clone())
                .collect(),
            resources: catalog.resources.len(),
            prompts: catalog.prompts.len(),
            stats: conn.stats(),
            pool: (transport == TransportKind::Http).then(|| self.pool.stats(&conn.name)),
        }
    }

    pub fn snapshot(&self) -> Vec<ServerInfo> {
        self.list_servers()
            .iter()
            .map(|conn| self.server_info(conn))
            .collect()
    }

    /// Closes every transport and the pool. Servers stay registered as
    /// `Disconnected`.
    pub async fn shutdown(&self) {
        let servers = self.list_servers();
        join_all(servers.iter().map(|conn| async move {
            if let Err(e) = conn.client.close().await {
                tracing::warn!(server = %conn.name, error = %e, "Error closing MCP server");
            }
            conn.set_status(ServerStatus::Disconnected, None);
        }))
        .await;
        self.pool.close();
        tracing::info!(servers = servers.len(), "MCP servers shut down");
    }
}
