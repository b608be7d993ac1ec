use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use super::tool_loop::ToolLoopError;
use crate::backend::BackendError;
use crate::mcp::McpError;

/// Errors surfaced to HTTP clients, in the `OpenAI` error envelope.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{message}")]
    BadRequest { message: String, request_id: String },
    #[error("{message}")]
    Backend { message: String, request_id: String },
    #[error("{message}")]
    NotFound { message: String, request_id: String },
    #[error("{message}")]
    Internal { message: String, request_id: String },
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>, request_id: &str) -> Self {
        Self::BadRequest {
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn backend(err: &BackendError, request_id: &str) -> Self {
        Self::Backend {
            message: err.to_string(),
            request_id: request_id.to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>, request_id: &str) -> Self {
        Self::NotFound {
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>, request_id: &str) -> Self {
        Self::Internal {
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn from_mcp(err: &McpError, request_id: &str) -> Self {
        match err {
            McpError::NotFound(_) => Self::not_found(err.to_string(), request_id),
            _ => Self::internal(err.to_string(), request_id),
        }
    }

    pub fn from_tool_loop(err: &ToolLoopError, request_id: &str) -> Self {
        match err {
            ToolLoopError::Backend(e) => Self::backend(e, request_id),
            ToolLoopError::Cancelled => Self::internal(err.to_string(), request_id),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "invalid_request_error",
            Self::Backend { .. } => "server_error",
            Self::NotFound { .. } => "not_found",
            Self::Internal { .. } => "internal_error",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::BadRequest { request_id, .. }
            | Self::Backend { request_id, .. }
            | Self::NotFound { request_id, .. }
            | Self::Internal { request_id, .. } => request_id,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id(), status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(request_id = %self.request_id(), status = status.as_u16(), error = %self, "Request rejected");
        }
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "request_id": self.request_id(),
            }
        });
        (status, Json(body)).into_response()
    }
}
