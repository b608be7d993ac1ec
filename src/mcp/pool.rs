//! Per-server pool of HTTP clients for the HTTP transport.
//!
//! Each server gets a semaphore sized to `max_connections`; a permit is held
//! for as long as a [`PooledConnection`] is alive, so a busy server blocks new
//! acquisitions (up to `acquire_timeout`) instead of opening more sockets.
//! Released clients go onto an idle list and are reused until they have been
//! idle for longer than `max_idle`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

use super::error::{McpError, McpResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct IdleClient {
    client: reqwest::Client,
    last_used: Instant,
}

#[derive(Debug)]
struct ServerPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleClient>>,
}

/// Snapshot of one server's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: usize,
    pub in_use: usize,
    pub idle: usize,
}

/// A checked-out client. Dropping it frees the slot but discards the client;
/// hand it back with [`ConnectionPool::release`] to keep it for reuse.
#[derive(Debug)]
pub struct PooledConnection {
    server: String,
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    servers: RwLock<HashMap<String, Arc<ServerPool>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn server_pool(&self, server: &str) -> Arc<ServerPool> {
        if let Some(pool) = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
        {
            return Arc::clone(pool);
        }
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let pool = servers.entry(server.to_string()).or_insert_with(|| {
            Arc::new(ServerPool {
                permits: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
                idle: Mutex::new(Vec::new()),
            })
        });
        Arc::clone(pool)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self, server: &str) -> McpResult<PooledConnection> {
        let pool = self.server_pool(server);
        // Checked after the pool is registered so a concurrent `close` either
        // shows up here or closes this pool's semaphore.
        if self.is_closed() {
            return Err(McpError::Closed);
        }

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(McpError::Closed),
            Err(_) => {
                tracing::warn!(
                    server = %server,
                    max_connections = self.config.max_connections,
                    "Connection pool exhausted"
                );
                return Err(McpError::PoolExhausted(server.to_string()));
            }
        };

        let reused = {
            let now = Instant::now();
            let mut idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.retain(|c| now.duration_since(c.last_used) <= self.config.max_idle);
            idle.pop().map(|c| c.client)
        };

        let client = match reused {
            Some(client) => client,
            None => build_client()?,
        };

        Ok(PooledConnection {
            server: server.to_string(),
            client,
            _permit: permit,
        })
    }

    pub fn release(&self, conn: PooledConnection) {
        if self.is_closed() {
            return;
        }
        let pool = self.server_pool(&conn.server);
        pool.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(IdleClient {
                client: conn.client,
                last_used: Instant::now(),
            });
        // The permit is dropped with the rest of `conn`.
    }

    /// Drops clients idle past `max_idle`. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let pools: Vec<Arc<ServerPool>> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut closed = 0;
        for pool in pools {
            let mut idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let before = idle.len();
            idle.retain(|c| now.duration_since(c.last_used) <= self.config.max_idle);
            closed += before - idle.len();
        }
        if closed > 0 {
            tracing::debug!(closed, "Closed idle MCP HTTP connections");
        }
        closed
    }

    pub fn stats(&self, server: &str) -> PoolStats {
        let max = self.config.max_connections.max(1);
        match self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
        {
            Some(pool) => PoolStats {
                max,
                in_use: max - pool.permits.available_permits(),
                idle: pool.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
            },
            None => PoolStats {
                max,
                in_use: 0,
                idle: 0,
            },
        }
    }

    /// Drops every idle client and fails any waiting or later acquisition.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        for pool in servers.values() {
            pool.permits.close();
            pool.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }
}

fn build_client() -> McpResult<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(1)
        .build()
        .map_err(|e| McpError::Connection(format!("failed to build HTTP client: {e}")))
}
