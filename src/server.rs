use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::backend::{BackendClient, ChatBackend};
use crate::cache::ResponseCache;
use crate::config::AppConfig;
use crate::mcp::{ConnectionPool, HealthMonitor, ServerManager, config::load_servers};
use crate::proxy::{self, ToolLoop};
use crate::tools::{Guardrails, ToolManager};

/// Builds the shared state and connects every configured MCP server.
///
/// Servers that fail to connect stay registered as disconnected; the health
/// monitor keeps retrying them.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let backend = Arc::new(
        BackendClient::new(&config.backend.host, config.backend_timeout())
            .context("failed to create backend client")?,
    );
    info!(
        name: "backend.config.loaded",
        host = %backend.base_url(),
        "Backend configuration loaded"
    );

    let pool = Arc::new(ConnectionPool::new(config.pool_config()));
    let servers = Arc::new(ServerManager::new(pool).with_retry(config.retry_policy()));

    if config.mcp.enabled {
        if let Some(path) = &config.mcp.servers_file {
            let configs = load_servers(path)
                .with_context(|| format!("failed to load MCP servers from {path}"))?;
            let connected = servers.connect_all(&configs).await;
            info!(
                name: "mcp.servers.connected",
                configured = configs.len(),
                connected,
                "MCP servers connected"
            );
            for tool in servers.list_all_tools() {
                info!(name: "mcp.tool.discovered", tool = %tool.namespaced_name, "MCP tool discovered");
            }
        } else {
            tracing::warn!("MCP is enabled but no servers file is configured");
        }
    }

    let guardrails = Arc::new(
        Guardrails::new(config.guardrail_policy()).context("invalid tool guardrail policy")?,
    );
    let tools = Arc::new(ToolManager::new(Arc::clone(&servers), guardrails));
    let tool_loop = Arc::new(ToolLoop::new(
        Arc::clone(&backend) as Arc<dyn ChatBackend>,
        Arc::clone(&tools),
    ));
    let cache = Arc::new(ResponseCache::new(config.cache_config()));
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&servers),
        config.health_config(),
    ));

    Ok(AppState {
        config,
        backend,
        servers,
        tools,
        tool_loop,
        cache,
        health,
    })
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;

    if config.mcp.enabled {
        state.health.start();
    }
    if state.cache.is_enabled() {
        state.cache.start_sweeper();
    }

    let timeout_duration = config.request_timeout();
    let app = proxy::router(state.clone())
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB limit
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout_duration;
                async move {
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => {
                            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
                        }
                    }
                }
            },
        ))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        name: "server.started",
        address = %addr,
        mcp_enabled = config.mcp.enabled,
        cache_enabled = state.cache.is_enabled(),
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.health.stop().await;
    state.cache.stop_sweeper().await;
    state.servers.shutdown().await;
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
