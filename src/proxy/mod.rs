//! OpenAI-compatible HTTP surface.
//!
//! - `POST /v1/chat/completions`: cache, then the tool loop or a plain backend call
//! - `GET /v1/models`: the backend's model list
//! - `/v1/mcp/...`: tool server inspection, resources, prompts, refresh, and
//!   direct tool execution
//! - `GET /health`: backend reachability plus server and cache summaries

pub mod error;
pub mod management;
pub mod resource_context;
pub mod routes;
pub mod tool_loop;
pub mod types;

pub use error::ProxyError;
pub use tool_loop::{ToolLoop, ToolLoopOutcome, ToolLoopRequest, TerminationReason};

use axum::{
    Router,
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use uuid::Uuid;

use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The caller's `X-Request-ID`, or a fresh v4 UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string)
}

/// Pins one request id on the request and echoes it on the response.
async fn propagate_request_id(mut req: Request, next: Next) -> Response {
    let id = request_id(req.headers());
    let Ok(value) = HeaderValue::from_str(&id) else {
        return next.run(req).await;
    };
    req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    resp
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/models", get(routes::list_models))
        .route("/v1/mcp/servers", get(management::list_servers))
        .route("/v1/mcp/servers/health", get(management::all_health))
        .route("/v1/mcp/servers/{name}", get(management::get_server))
        .route("/v1/mcp/servers/{name}/health", get(management::server_health))
        .route("/v1/mcp/servers/{name}/stats", get(management::server_stats))
        .route("/v1/mcp/servers/{name}/tools", get(management::server_tools))
        .route("/v1/mcp/servers/{name}/resources", get(management::server_resources))
        .route(
            "/v1/mcp/servers/{name}/resources/{*uri}",
            get(management::read_resource),
        )
        .route("/v1/mcp/servers/{name}/prompts", get(management::server_prompts))
        .route(
            "/v1/mcp/servers/{name}/prompts/{prompt}",
            post(management::get_prompt),
        )
        .route("/v1/mcp/servers/{name}/refresh", post(management::refresh_server))
        .route("/v1/mcp/tools", get(management::list_tools))
        .route("/v1/mcp/execute", post(management::execute_tool))
        .route("/health", get(management::health))
        .layer(middleware::from_fn(propagate_request_id))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_header_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  abc-123 "));
        assert_eq!(request_id(&headers), "abc-123");

        let generated = request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
