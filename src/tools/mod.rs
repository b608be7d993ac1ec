//! Tool execution on behalf of the model.
//!
//! [`ToolManager`] joins the [`ServerManager`] with the [`Guardrails`]: it
//! decides which tools the model may see and runs each call under the policy,
//! turning every outcome (including denials and timeouts) into a
//! [`ToolCallResult`] the tool loop can hand back to the model.

pub mod guardrails;
pub mod mapper;

pub use guardrails::{GuardrailError, GuardrailPolicy, Guardrails, RoundBudget, TRUNCATION_MARKER};
pub use mapper::{FunctionTool, to_openai_function, to_openai_tools};

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::mcp::{McpError, ServerManager, ToolDescriptor};

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub namespaced_name: String,
    pub arguments: Value,
    pub request_id: Option<String>,
    /// Latest moment the call may still be running.
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl ToolCallResult {
    pub fn failure(err: &McpError, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            duration_ms,
            truncated: false,
        }
    }

    /// Text placed in the `tool` message the model sees.
    pub fn to_content(&self) -> String {
        if self.success {
            return self.output.clone();
        }
        json!({
            "error": self.error.as_deref().unwrap_or("unknown error"),
            "kind": self.error_kind.unwrap_or("error"),
        })
        .to_string()
    }
}

#[derive(Debug)]
pub struct ToolManager {
    servers: Arc<ServerManager>,
    guardrails: Arc<Guardrails>,
}

impl ToolManager {
    pub fn new(servers: Arc<ServerManager>, guardrails: Arc<Guardrails>) -> Self {
        Self {
            servers,
            guardrails,
        }
    }

    pub fn guardrails(&self) -> &Arc<Guardrails> {
        &self.guardrails
    }

    pub fn servers(&self) -> &Arc<ServerManager> {
        &self.servers
    }

    /// Tools on healthy servers that the policy permits.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.servers
            .list_all_tools()
            .into_iter()
            .filter(|t| self.guardrails.is_allowed(&t.namespaced_name))
            .collect()
    }

    /// Runs one call. Never fails: denials, timeouts, and remote errors come
    /// back as unsuccessful results.
    pub async fn execute(&self, request: ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();
        let name = request.namespaced_name.as_str();

        if let Err(e) = self.guardrails.check_allowed(name) {
            tracing::warn!(request_id = ?request.request_id, tool = %name, error = %e, "Tool call denied");
            return ToolCallResult::failure(&e, 0);
        }

        let remaining = request.deadline.saturating_duration_since(started);
        let request_id = request.request_id.as_deref();
        let outcome = self
            .guardrails
            .enforce_timeout(remaining, |limit| {
                self.servers
                    .execute_tool(name, request.arguments, limit, request_id)
            })
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(result) => {
                let (output, truncated) = self.guardrails.truncate(result.text());
                tracing::info!(
                    request_id = ?request.request_id,
                    tool = %name,
                    duration_ms,
                    output_len = output.len(),
                    truncated,
                    "Tool call succeeded"
                );
                ToolCallResult {
                    success: true,
                    output,
                    error: None,
                    error_kind: None,
                    duration_ms,
                    truncated,
                }
            }
            Err(e) => {
                tracing::warn!(
                    request_id = ?request.request_id,
                    tool = %name,
                    duration_ms,
                    kind = e.kind(),
                    error = %e,
                    "Tool call failed"
                );
                ToolCallResult::failure(&e, duration_ms)
            }
        }
    }
}
