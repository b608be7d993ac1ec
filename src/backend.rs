//! Client for the Ollama-style inference backend (`/api/chat`, `/api/tags`)
//! and conversion of its replies to `OpenAI` wire shapes.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::proxy::types::{
    ChatCompletion, ChatCompletionChunk, ChatMessage, ChunkChoice, ChunkDelta, ToolCall, Usage,
};
use crate::tools::FunctionTool;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendChatRequest {
    pub model: String,
    pub messages: Vec<BackendMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<FunctionTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<BackendOptions>,
}

impl BackendChatRequest {
    pub fn new(model: &str, messages: &[ChatMessage], stream: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.iter().map(BackendMessage::from_openai).collect(),
            stream,
            tools: Vec::new(),
            options: None,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<FunctionTool>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, temperature: Option<f64>, max_tokens: Option<u32>) -> Self {
        if temperature.is_some() || max_tokens.is_some() {
            self.options = Some(BackendOptions {
                temperature,
                num_predict: max_tokens,
            });
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<BackendToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: BackendFunctionCall,
}

/// The backend passes arguments as a JSON object, not an encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl BackendMessage {
    pub fn from_openai(msg: &ChatMessage) -> Self {
        let tool_calls = msg
            .tool_calls
            .iter()
            .flatten()
            .map(|call| BackendToolCall {
                id: Some(call.id.clone()),
                function: BackendFunctionCall {
                    name: call.function.name.clone(),
                    arguments: call
                        .parsed_arguments()
                        .unwrap_or_else(|_| Value::String(call.function.arguments.clone())),
                },
            })
            .collect();
        Self {
            role: msg.role.clone(),
            content: msg.text(),
            tool_calls,
        }
    }

    pub fn into_openai(self) -> ChatMessage {
        let mut msg = ChatMessage::assistant(self.content);
        if !self.role.is_empty() {
            msg.role = self.role;
        }
        if !self.tool_calls.is_empty() {
            msg.tool_calls = Some(
                self.tool_calls
                    .into_iter()
                    .map(|call| {
                        let mut converted = ToolCall::new(call.function.name, &call.function.arguments);
                        if let Value::String(raw) = call.function.arguments {
                            converted.function.arguments = raw;
                        }
                        if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                            converted.id = id;
                        }
                        converted
                    })
                    .collect(),
            );
            if msg.text().is_empty() {
                msg.content = Value::Null;
            }
        }
        msg
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub message: Option<BackendMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

impl BackendChatResponse {
    pub fn usage(&self) -> Option<Usage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        let prompt = self.prompt_eval_count.unwrap_or(0);
        let completion = self.eval_count.unwrap_or(0);
        Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        })
    }

    /// Converts a complete reply into an `OpenAI` `chat.completion`.
    pub fn into_completion(self, model: &str) -> ChatCompletion {
        let usage = self.usage();
        let message = self.message.unwrap_or_default().into_openai();
        let finish_reason = if message.has_tool_calls() {
            "tool_calls"
        } else {
            match self.done_reason.as_deref() {
                Some("length") => "length",
                _ => "stop",
            }
        };
        let mut completion = ChatCompletion::new(model, message, finish_reason);
        completion.usage = usage;
        completion
    }

    /// Converts one streamed line into an `OpenAI` chunk. The final line
    /// carries `finish_reason: "stop"`.
    pub fn to_chunk(&self, id: &str, model: &str, created: i64) -> ChatCompletionChunk {
        let content = self
            .message
            .as_ref()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                },
                finish_reason: self.done.then(|| "stop".to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendModel {
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<BackendModel>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<BackendChatResponse, BackendError>> + Send>>;

/// The model side of the tool loop.
#[async_trait]
pub trait ChatBackend: Send + Sync + std::fmt::Debug {
    async fn chat(
        &self,
        request: &BackendChatRequest,
        request_id: &str,
    ) -> Result<BackendChatResponse, BackendError>;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_chat(
        &self,
        request: &BackendChatRequest,
        request_id: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("X-Request-ID", request_id)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        check_status(resp).await
    }

    /// Streams the backend's newline-delimited JSON replies.
    pub async fn chat_stream(
        &self,
        request: &BackendChatRequest,
        request_id: &str,
    ) -> Result<ChatStream, BackendError> {
        let resp = self.post_chat(request, request_id).await?;
        let byte_stream = resp.bytes_stream();
        let request_id = request_id.to_string();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut finished = false;
            futures::pin_mut!(byte_stream);

            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| BackendError::Unreachable(e.to_string()))?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.drain(..=pos).collect::<Vec<_>>();
                    if let Some(parsed) = parse_stream_line(&line, &request_id) {
                        finished = parsed.done;
                        yield parsed;
                        if finished {
                            break 'read;
                        }
                    }
                }
            }
            if !finished {
                if let Some(parsed) = parse_stream_line(&buf, &request_id) {
                    yield parsed;
                }
            }
        };
        Ok(Box::pin(out))
    }

    pub async fn list_models(&self, request_id: &str) -> Result<Vec<BackendModel>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-Request-ID", request_id)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        let tags: TagsResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(tags.models)
    }

    /// Liveness probe against `/api/tags` with its own short deadline.
    pub async fn ping(&self, timeout: Duration, request_id: &str) -> Result<(), BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-Request-ID", request_id)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }
}

#[async_trait]
impl ChatBackend for BackendClient {
    async fn chat(
        &self,
        request: &BackendChatRequest,
        request_id: &str,
    ) -> Result<BackendChatResponse, BackendError> {
        let resp = self.post_chat(request, request_id).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Parses one NDJSON line. Tolerates an SSE-style `data: ` prefix; blank and
/// unparsable lines are skipped.
fn parse_stream_line(line: &[u8], request_id: &str) -> Option<BackendChatResponse> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    let text = text.strip_prefix("data:").map_or(text, str::trim);
    if text.is_empty() || text == "[DONE]" {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Skipping unparsable backend stream line");
            None
        }
    }
}
