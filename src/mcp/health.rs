use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::manager::{ServerConnection, ServerManager, ServerStatus};
use crate::lifecycle::BackgroundTask;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Deadline for a single health check.
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Periodically checks every registered server, independent of request traffic.
#[derive(Debug)]
pub struct HealthMonitor {
    manager: Arc<ServerManager>,
    config: HealthConfig,
    task: BackgroundTask,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ServerManager>, config: HealthConfig) -> Self {
        Self {
            manager,
            config,
            task: BackgroundTask::new("health-monitor"),
        }
    }

    /// Starts the check loop. A second call while running does nothing.
    pub fn start(&self) -> bool {
        let manager = Arc::clone(&self.manager);
        let config = self.config.clone();
        let started = self
            .task
            .start(move |token| run(manager, config, token));
        if started {
            tracing::info!(interval_secs = self.config.interval.as_secs(), "Health monitor started");
        }
        started
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// One pass over every server, plus an idle-connection sweep.
    pub async fn check_all(&self) {
        check_all(&self.manager, self.config.timeout).await;
    }

    /// Checks one server on demand. Unlike the periodic pass this never
    /// reconnects, so callers outside the monitor can't spawn processes.
    pub async fn check_server(&self, conn: &ServerConnection) -> ServerStatus {
        check_server(conn, self.config.timeout, false).await
    }
}

async fn run(manager: Arc<ServerManager>, config: HealthConfig, token: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already connected everything.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = check_all(&manager, config.timeout) => {}
                }
            }
        }
    }
    tracing::info!("Health monitor stopped");
}

async fn check_all(manager: &ServerManager, timeout: Duration) {
    let servers = manager.list_servers();
    join_all(servers.iter().map(|conn| check_server(conn, timeout, true))).await;

    let swept = manager.pool().sweep_idle();
    if swept > 0 {
        tracing::debug!(swept, "Closed idle MCP connections");
    }
}

/// Checks one server. With `reconnect` set, a server whose transport has
/// gone away is re-established in the same pass; without it the server is
/// only marked `Disconnected`.
async fn check_server(conn: &ServerConnection, timeout: Duration, reconnect: bool) -> ServerStatus {
    let previous = conn.status();
    let next = match previous {
        ServerStatus::Disconnected if reconnect => reestablish(conn).await,
        ServerStatus::Disconnected => ServerStatus::Disconnected,
        // A connect is in flight elsewhere; leave it alone.
        ServerStatus::Connecting => ServerStatus::Connecting,
        ServerStatus::Healthy | ServerStatus::Degraded if conn.client().is_closed() => {
            tracing::warn!(server = %conn.name(), "MCP server transport closed");
            conn.set_status(ServerStatus::Disconnected, Some("transport closed".into()));
            if reconnect {
                reestablish(conn).await
            } else {
                ServerStatus::Disconnected
            }
        }
        ServerStatus::Healthy | ServerStatus::Degraded => match conn.client().ping(timeout).await {
            Ok(()) if previous == ServerStatus::Degraded => match conn.refresh_catalog().await {
                Ok(()) => {
                    tracing::info!(server = %conn.name(), "MCP server recovered");
                    conn.set_status(ServerStatus::Healthy, None);
                    ServerStatus::Healthy
                }
                Err(e) => {
                    conn.set_status(ServerStatus::Degraded, Some(e.to_string()));
                    ServerStatus::Degraded
                }
            },
            Ok(()) => ServerStatus::Healthy,
            Err(e) if conn.client().is_closed() => {
                tracing::warn!(server = %conn.name(), error = %e, "MCP server went away during health check");
                conn.set_status(ServerStatus::Disconnected, Some(e.to_string()));
                ServerStatus::Disconnected
            }
            Err(e) => {
                tracing::warn!(server = %conn.name(), error = %e, "Health check failed");
                conn.set_status(ServerStatus::Degraded, Some(e.to_string()));
                ServerStatus::Degraded
            }
        },
    };
    conn.touch_health_check();
    next
}

async fn reestablish(conn: &ServerConnection) -> ServerStatus {
    match conn.establish().await {
        Ok(()) => {
            tracing::info!(server = %conn.name(), "MCP server reconnected");
            ServerStatus::Healthy
        }
        Err(e) => {
            tracing::debug!(server = %conn.name(), error = %e, "Reconnect attempt failed");
            ServerStatus::Disconnected
        }
    }
}
