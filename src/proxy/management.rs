//! Management endpoints for the tool servers, and the gateway health check.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::Instant;

use super::{ProxyError, request_id};
use crate::AppState;
use crate::mcp::{ServerConnection, ServerInfo, ServerStatus, ToolDescriptor};
use crate::tools::ToolCallRequest;

#[derive(Debug, Serialize)]
struct ToolView<'a> {
    name: &'a str,
    server: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

impl<'a> From<&'a ToolDescriptor> for ToolView<'a> {
    fn from(t: &'a ToolDescriptor) -> Self {
        Self {
            name: &t.namespaced_name,
            server: &t.server_name,
            description: &t.description,
            input_schema: &t.input_schema,
        }
    }
}

/// GET /v1/mcp/servers
pub async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    let servers = state.servers.snapshot();
    Json(json!({ "servers": servers, "count": servers.len() }))
}

fn lookup(state: &AppState, name: &str, headers: &HeaderMap) -> Result<Arc<ServerConnection>, ProxyError> {
    state
        .servers
        .get_server(name)
        .map_err(|e| ProxyError::from_mcp(&e, &request_id(headers)))
}

/// GET /v1/mcp/servers/{name}
pub async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServerInfo>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    Ok(Json(state.servers.server_info(&conn)))
}

/// GET /v1/mcp/servers/health
///
/// Last observed health of every server; nothing is contacted.
pub async fn all_health(State(state): State<AppState>) -> Json<Value> {
    let servers: BTreeMap<String, Value> = state
        .servers
        .list_servers()
        .iter()
        .map(|conn| {
            let entry = json!({
                "status": conn.status(),
                "last_health_check": conn.last_health_check(),
                "last_error": conn.last_error(),
            });
            (conn.name().to_string(), entry)
        })
        .collect();
    Json(json!({ "count": servers.len(), "servers": servers }))
}

/// GET /v1/mcp/servers/{name}/stats
pub async fn server_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    let info = state.servers.server_info(&conn);
    Ok(Json(json!({ "server": name, "stats": info.stats, "pool": info.pool })))
}

/// GET /v1/mcp/servers/{name}/health
///
/// Checks the server immediately instead of reporting the last periodic
/// result. A dead server is reported, not restarted; reconnects belong to the
/// monitor.
pub async fn server_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    let status = state.health.check_server(&conn).await;
    Ok(Json(json!({
        "server": name,
        "status": status,
        "last_health_check": conn.last_health_check(),
        "last_error": conn.last_error(),
    })))
}

/// GET /v1/mcp/servers/{name}/tools
pub async fn server_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    let catalog = conn.catalog();
    let tools: Vec<ToolView<'_>> = catalog.tools.iter().map(ToolView::from).collect();
    Ok(Json(json!({ "server": name, "tools": tools, "count": tools.len() })))
}

/// GET /v1/mcp/servers/{name}/resources
pub async fn server_resources(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    let catalog = conn.catalog();
    Ok(Json(json!({
        "server": name,
        "resources": catalog.resources,
        "count": catalog.resources.len(),
    })))
}

/// GET /v1/mcp/servers/{name}/resources/{*uri}
///
/// The URI is the rest of the path, percent-encoded or not.
pub async fn read_resource(
    State(state): State<AppState>,
    Path((name, uri)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let request_id = request_id(&headers);
    let uri = uri.strip_prefix('/').unwrap_or(&uri);
    if uri.is_empty() {
        return Err(ProxyError::bad_request("resource URI is required", &request_id));
    }
    let result = state
        .servers
        .read_resource(&name, uri, state.config.resource_fetch_timeout())
        .await
        .map_err(|e| ProxyError::from_mcp(&e, &request_id))?;
    Ok(Json(json!({ "server": name, "uri": uri, "contents": result.contents })))
}

/// GET /v1/mcp/servers/{name}/prompts
pub async fn server_prompts(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let conn = lookup(&state, &name, &headers)?;
    let catalog = conn.catalog();
    Ok(Json(json!({
        "server": name,
        "prompts": catalog.prompts,
        "count": catalog.prompts.len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct PromptArguments {
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// POST /v1/mcp/servers/{name}/prompts/{prompt}
///
/// The body is optional: `{"arguments": {...}}`.
pub async fn get_prompt(
    State(state): State<AppState>,
    Path((name, prompt)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ProxyError> {
    let request_id = request_id(&headers);
    let args: PromptArguments = if body.iter().all(u8::is_ascii_whitespace) {
        PromptArguments::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::bad_request(format!("invalid prompt arguments: {e}"), &request_id))?
    };
    let result = state
        .servers
        .get_prompt(&name, &prompt, args.arguments)
        .await
        .map_err(|e| ProxyError::from_mcp(&e, &request_id))?;
    Ok(Json(json!({
        "server": name,
        "prompt": prompt,
        "description": result.description,
        "messages": result.messages,
    })))
}

/// POST /v1/mcp/servers/{name}/refresh
///
/// Re-discovers tools, resources, and prompts and swaps the catalog.
pub async fn refresh_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    let request_id = request_id(&headers);
    let conn = lookup(&state, &name, &headers)?;
    conn.refresh_catalog()
        .await
        .map_err(|e| ProxyError::from_mcp(&e, &request_id))?;
    let catalog = conn.catalog();
    tracing::info!(
        request_id = %request_id,
        server = %name,
        tools = catalog.tools.len(),
        "Server catalog refreshed"
    );
    Ok(Json(json!({
        "server": name,
        "status": "refreshed",
        "tools": catalog.tools.len(),
        "resources": catalog.resources.len(),
        "prompts": catalog.prompts.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolBody {
    /// Namespaced name, e.g. `mcp.files.read`.
    pub tool: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// POST /v1/mcp/execute
///
/// Runs one tool through the same guardrails the tool loop uses.
pub async fn execute_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ExecuteToolBody>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let request_id = request_id(&headers);
    let Json(body) = body.map_err(|e| ProxyError::bad_request(e.body_text(), &request_id))?;

    let result = state
        .tools
        .execute(ToolCallRequest {
            namespaced_name: body.tool.clone(),
            arguments: body.arguments.unwrap_or_else(|| json!({})),
            request_id: Some(request_id.clone()),
            deadline: Instant::now() + state.config.request_timeout(),
        })
        .await;

    let status = match result.error_kind {
        None => StatusCode::OK,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("policy_denied") => StatusCode::FORBIDDEN,
        Some("timeout") => StatusCode::GATEWAY_TIMEOUT,
        Some(_) => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(json!({ "tool": body.tool, "result": result }))).into_response())
}

/// GET /v1/mcp/tools
///
/// Tools the model is offered: healthy servers only, after the allow and deny lists.
pub async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    let tools = state.tools.available_tools();
    let views: Vec<ToolView<'_>> = tools.iter().map(ToolView::from).collect();
    Json(json!({ "tools": views, "count": views.len() }))
}

/// GET /health
pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let mut by_status: BTreeMap<ServerStatus, usize> = BTreeMap::new();
    for conn in state.servers.list_servers() {
        *by_status.entry(conn.status()).or_default() += 1;
    }
    let servers: BTreeMap<String, usize> = by_status
        .into_iter()
        .map(|(status, n)| (status.to_string(), n))
        .collect();
    let mcp = json!({
        "enabled": state.config.mcp.enabled,
        "servers": servers,
        "tools": state.tools.available_tools().len(),
    });
    let cache = state.cache.stats();
    let backend_host = state.backend.base_url();

    match state
        .backend
        .ping(state.config.health_config().timeout, &request_id)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "backend": "connected",
                "backend_host": backend_host,
                "mcp": mcp,
                "cache": cache,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, backend_host = %backend_host, "Health check: backend unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "backend_host": backend_host,
                    "mcp": mcp,
                    "cache": cache,
                })),
            )
                .into_response()
        }
    }
}
