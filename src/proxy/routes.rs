use std::convert::Infallible;

use axum::{
    Json,
    body::Bytes,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ProxyError, request_id,
    resource_context::inject_resource_context,
    tool_loop::{TerminationReason, ToolLoopRequest},
    types::{ChatCompletion, ChatCompletionRequest, ChatMessage, GatewayMeta, ModelCard, ModelList},
};
use crate::AppState;
use crate::backend::{BackendChatRequest, ChatBackend};
use crate::cache::CacheKey;

fn json_body(body: Bytes, cache_status: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (HeaderName::from_static("x-cache"), HeaderValue::from_static(cache_status)),
        ],
        body,
    )
        .into_response()
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let request_id = request_id(&headers);
    let Json(req) = body.map_err(|e| ProxyError::bad_request(e.body_text(), &request_id))?;
    req.validate()
        .map_err(|msg| ProxyError::bad_request(msg, &request_id))?;

    tracing::info!(
        request_id = %request_id,
        model = %req.model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    if req.stream {
        let mut messages = req.messages.clone();
        inject_resource_context(
            &state.servers,
            &mut messages,
            state.config.resource_fetch_timeout(),
            &request_id,
        )
        .await;
        return stream_completion(&state, &req, &messages, request_id).await;
    }

    // Keyed on the client's messages, before any resource context is inlined.
    let cache_key = if state.cache.is_enabled() {
        match CacheKey::new(&req.model, &req.messages) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Cannot derive cache key");
                None
            }
        }
    } else {
        None
    };
    if let Some(hit) = cache_key.as_ref().and_then(|k| state.cache.get(k)) {
        tracing::debug!(request_id = %request_id, model = %req.model, "Cache hit");
        return Ok(json_body(hit, "HIT"));
    }

    let mut messages = req.messages.clone();
    inject_resource_context(
        &state.servers,
        &mut messages,
        state.config.resource_fetch_timeout(),
        &request_id,
    )
    .await;

    let use_tools = !req.tools_disabled() && !state.tools.available_tools().is_empty();
    let (completion, cacheable) = if use_tools {
        run_tool_loop(&state, &req, messages, &request_id).await?
    } else {
        let request = BackendChatRequest::new(&req.model, &messages, false)
            .with_sampling(req.temperature, req.max_tokens);
        let reply = state
            .backend
            .chat(&request, &request_id)
            .await
            .map_err(|e| ProxyError::backend(&e, &request_id))?;
        (reply.into_completion(&req.model), true)
    };

    let body = serde_json::to_vec(&completion)
        .map(Bytes::from)
        .map_err(|e| ProxyError::internal(e.to_string(), &request_id))?;
    if cacheable {
        if let Some(key) = cache_key {
            state.cache.set(key, body.clone());
        }
    }
    Ok(json_body(body, "MISS"))
}

/// Runs the tool loop. Only completed exchanges are cacheable; a reply cut
/// short by a limit carries the gateway extension block instead.
async fn run_tool_loop(
    state: &AppState,
    req: &ChatCompletionRequest,
    messages: Vec<ChatMessage>,
    request_id: &str,
) -> Result<(ChatCompletion, bool), ProxyError> {
    let cancel = CancellationToken::new();
    // Cancels in-flight work if the client goes away and this future is dropped.
    let _guard = cancel.clone().drop_guard();

    let outcome = state
        .tool_loop
        .run(
            ToolLoopRequest {
                model: req.model.clone(),
                messages,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                request_id: request_id.to_string(),
            },
            &cancel,
        )
        .await
        .map_err(|e| ProxyError::from_tool_loop(&e, request_id))?;

    let completed = outcome.termination == TerminationReason::Completed;
    let mut completion = ChatCompletion::new(&req.model, outcome.message, "stop");
    completion.usage = outcome.usage;
    if !completed {
        completion.toolgate = Some(GatewayMeta {
            termination_reason: outcome.termination,
            rounds: outcome.rounds,
            tool_calls: outcome.total_calls,
        });
    }
    Ok((completion, completed))
}

/// Relays the backend's NDJSON stream as `OpenAI` SSE chunks ending in `[DONE]`.
async fn stream_completion(
    state: &AppState,
    req: &ChatCompletionRequest,
    messages: &[ChatMessage],
    request_id: String,
) -> Result<Response, ProxyError> {
    let request = BackendChatRequest::new(&req.model, messages, true)
        .with_sampling(req.temperature, req.max_tokens);
    let mut upstream = state
        .backend
        .chat_stream(&request, &request_id)
        .await
        .map_err(|e| ProxyError::backend(&e, &request_id))?;

    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();
    let model = req.model.clone();

    let stream = async_stream::stream! {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(part) => {
                    match Event::default().json_data(part.to_chunk(&id, &model, created)) {
                        Ok(event) => {
                            yield Ok::<_, Infallible>(event);
                        }
                        Err(e) => {
                            tracing::warn!(request_id = %request_id, error = %e, "Dropping unserializable chunk");
                        }
                    }
                    if part.done {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Backend stream failed");
                    let payload = json!({
                        "error": {
                            "message": e.to_string(),
                            "type": "server_error",
                            "request_id": request_id,
                        }
                    });
                    yield Ok(Event::default().data(payload.to_string()));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// GET /v1/models
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, ProxyError> {
    let request_id = request_id(&headers);
    let models = state
        .backend
        .list_models(&request_id)
        .await
        .map_err(|e| ProxyError::backend(&e, &request_id))?;

    Ok(Json(ModelList {
        object: "list".to_string(),
        data: models
            .into_iter()
            .map(|m| ModelCard {
                id: m.name,
                object: "model".to_string(),
                created: 0,
                owned_by: "ollama".to_string(),
            })
            .collect(),
    }))
}
