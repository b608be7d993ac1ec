//! Multi-round model/tool exchange for one chat request.
//!
//! [`ToolLoopState`] holds the conversation and the counters and moves between
//! phases through synchronous transitions. [`ToolLoop`] drives it: it performs
//! the backend calls and the tool calls and feeds their outcomes back in.
//!
//! ```text
//! AwaitingModel --tool calls--> AwaitingTools --results--> AwaitingModel
//!       |                                                       |
//!       +--no tool calls--> Done        cap hit --> LimitReached
//!       +--backend error--> Failed
//! ```

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{ChatMessage, ToolCall, Usage};
use crate::backend::{BackendChatRequest, BackendError, ChatBackend};
use crate::mcp::ToolDescriptor;
use crate::tools::{GuardrailPolicy, RoundBudget, ToolCallRequest, ToolManager, to_openai_tools};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    MaxRoundsReached,
    MaxTotalCallsReached,
    BackendFailed,
}

impl TerminationReason {
    pub fn is_limit(self) -> bool {
        matches!(self, Self::MaxRoundsReached | Self::MaxTotalCallsReached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingModel,
    AwaitingTools,
    Done,
    LimitReached(TerminationReason),
    Failed,
}

#[derive(Debug, Clone)]
pub enum LoopEvent {
    ModelReplied(ChatMessage),
    ToolsResolved(Vec<ChatMessage>),
    BackendFailed,
}

/// Calls the model asked for in one round, split by the call budget. Admitted
/// calls always precede rejected ones in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundPlan {
    pub admitted: Vec<ToolCall>,
    pub rejected: Vec<(ToolCall, String)>,
}

#[derive(Debug, Clone)]
pub struct ToolLoopState {
    round: usize,
    max_rounds: usize,
    per_round: usize,
    messages: Vec<ChatMessage>,
    budget: RoundBudget,
    total_calls: usize,
    phase: LoopPhase,
    /// Most recent non-empty assistant text, returned when a limit stops the loop.
    best_answer: String,
}

impl ToolLoopState {
    pub fn new(messages: Vec<ChatMessage>, policy: &GuardrailPolicy) -> Self {
        Self {
            round: 0,
            max_rounds: policy.max_rounds_per_request,
            per_round: policy.max_calls_per_round,
            messages,
            budget: RoundBudget::new(policy.max_calls_per_round, policy.max_total_calls),
            total_calls: 0,
            phase: LoopPhase::AwaitingModel,
            best_answer: String::new(),
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Completed tool rounds.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls
    }

    pub fn call_budget_remaining(&self) -> usize {
        self.budget.remaining()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self.phase,
            LoopPhase::Done | LoopPhase::LimitReached(_) | LoopPhase::Failed
        )
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        match self.phase {
            LoopPhase::Done => Some(TerminationReason::Completed),
            LoopPhase::LimitReached(reason) => Some(reason),
            LoopPhase::Failed => Some(TerminationReason::BackendFailed),
            LoopPhase::AwaitingModel | LoopPhase::AwaitingTools => None,
        }
    }

    /// Feeds in the model's reply. Returns the calls to run, or `None` once the
    /// loop has terminated.
    pub fn on_model_reply(&mut self, reply: ChatMessage) -> Option<RoundPlan> {
        if self.phase != LoopPhase::AwaitingModel {
            return None;
        }
        let text = reply.text();
        if !text.is_empty() {
            self.best_answer = text;
        }

        let calls = reply.tool_calls.clone().unwrap_or_default();
        if calls.is_empty() {
            self.messages.push(reply);
            self.phase = LoopPhase::Done;
            return None;
        }
        if self.round >= self.max_rounds {
            self.phase = LoopPhase::LimitReached(TerminationReason::MaxRoundsReached);
            return None;
        }
        if self.budget.is_exhausted() {
            self.phase = LoopPhase::LimitReached(TerminationReason::MaxTotalCallsReached);
            return None;
        }

        self.messages.push(reply);
        let admitted = self.budget.admit(calls.len());
        self.total_calls += admitted;

        let mut calls = calls;
        let rejected = calls
            .split_off(admitted)
            .into_iter()
            .enumerate()
            .map(|(i, call)| {
                let reason = if admitted + i >= self.per_round {
                    format!(
                        "tool call rejected: at most {} tool calls per round",
                        self.per_round
                    )
                } else {
                    "tool call rejected: total tool call budget exhausted".to_string()
                };
                (call, reason)
            })
            .collect();

        self.phase = LoopPhase::AwaitingTools;
        Some(RoundPlan {
            admitted: calls,
            rejected,
        })
    }

    /// Appends the round's tool messages, in request order, and hands control
    /// back to the model.
    pub fn on_tools_resolved(&mut self, results: Vec<ChatMessage>) {
        if self.phase != LoopPhase::AwaitingTools {
            return;
        }
        self.messages.extend(results);
        self.round += 1;
        self.phase = LoopPhase::AwaitingModel;
    }

    pub fn on_backend_failure(&mut self) {
        self.phase = LoopPhase::Failed;
    }

    /// Single entry point over the transitions above.
    pub fn step(&mut self, event: LoopEvent) -> Option<RoundPlan> {
        match event {
            LoopEvent::ModelReplied(reply) => self.on_model_reply(reply),
            LoopEvent::ToolsResolved(results) => {
                self.on_tools_resolved(results);
                None
            }
            LoopEvent::BackendFailed => {
                self.on_backend_failure();
                None
            }
        }
    }

    /// The answer to return: the final assistant message when done, otherwise
    /// the best text seen so far without pending tool calls.
    pub fn final_message(&self) -> ChatMessage {
        match (self.phase, self.messages.last()) {
            (LoopPhase::Done, Some(last)) if last.role == "assistant" => last.clone(),
            _ => ChatMessage::assistant(self.best_answer.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    pub message: ChatMessage,
    pub rounds: usize,
    pub total_calls: usize,
    pub termination: TerminationReason,
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum ToolLoopError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ToolLoopRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub request_id: String,
}

/// System message listing the tools, for models that ignore the `tools` field.
pub fn tools_system_message(tools: &[ToolDescriptor]) -> ChatMessage {
    let lines = tools
        .iter()
        .map(|t| format!("- {}: {}", t.namespaced_name, t.description))
        .collect::<Vec<_>>()
        .join("\n");
    ChatMessage::system(format!(
        "Available tools:\n{lines}\n\nYou can call these tools by responding with tool_calls in your response."
    ))
}

#[derive(Debug, Clone)]
pub struct ToolLoop {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<ToolManager>,
}

impl ToolLoop {
    pub fn new(backend: Arc<dyn ChatBackend>, tools: Arc<ToolManager>) -> Self {
        Self { backend, tools }
    }

    pub async fn run(
        &self,
        request: ToolLoopRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolLoopOutcome, ToolLoopError> {
        let available = self.tools.available_tools();
        let functions = to_openai_tools(&available);

        let mut messages = request.messages;
        if !available.is_empty() && !messages.iter().any(|m| m.role == "system") {
            messages.insert(0, tools_system_message(&available));
        }

        let policy = self.tools.guardrails().policy().clone();
        let mut state = ToolLoopState::new(messages, &policy);
        let mut usage: Option<Usage> = None;

        tracing::info!(
            request_id = %request.request_id,
            tool_count = available.len(),
            max_rounds = policy.max_rounds_per_request,
            "Starting tool loop"
        );

        loop {
            let backend_request =
                BackendChatRequest::new(&request.model, state.messages(), false)
                    .with_tools(functions.clone())
                    .with_sampling(request.temperature, request.max_tokens);

            let reply = tokio::select! {
                () = cancel.cancelled() => return Err(ToolLoopError::Cancelled),
                reply = self.backend.chat(&backend_request, &request.request_id) => reply,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    state.step(LoopEvent::BackendFailed);
                    tracing::error!(
                        request_id = %request.request_id,
                        round = state.round(),
                        error = %e,
                        "Backend call failed inside tool loop"
                    );
                    return Err(e.into());
                }
            };

            if let Some(u) = reply.usage() {
                let acc = usage.get_or_insert_with(Usage::default);
                acc.prompt_tokens += u.prompt_tokens;
                acc.completion_tokens += u.completion_tokens;
                acc.total_tokens += u.total_tokens;
            }

            let message = reply.message.unwrap_or_default().into_openai();
            let Some(plan) = state.step(LoopEvent::ModelReplied(message)) else {
                break;
            };

            tracing::info!(
                request_id = %request.request_id,
                round = state.round() + 1,
                admitted = plan.admitted.len(),
                rejected = plan.rejected.len(),
                "Executing tool round"
            );

            let results = tokio::select! {
                () = cancel.cancelled() => return Err(ToolLoopError::Cancelled),
                results = self.run_round(plan, &request.request_id) => results,
            };
            state.step(LoopEvent::ToolsResolved(results));
        }

        let termination = state
            .termination_reason()
            .unwrap_or(TerminationReason::Completed);
        if termination.is_limit() {
            tracing::warn!(
                request_id = %request.request_id,
                rounds = state.round(),
                total_calls = state.total_calls(),
                reason = ?termination,
                "Tool loop stopped on a limit"
            );
        } else {
            tracing::info!(
                request_id = %request.request_id,
                rounds = state.round(),
                total_calls = state.total_calls(),
                "Tool loop completed"
            );
        }

        Ok(ToolLoopOutcome {
            message: state.final_message(),
            rounds: state.round(),
            total_calls: state.total_calls(),
            termination,
            usage,
        })
    }

    /// Runs the admitted calls concurrently and returns one tool message per
    /// requested call, in request order.
    async fn run_round(&self, plan: RoundPlan, request_id: &str) -> Vec<ChatMessage> {
        let deadline = Instant::now() + self.tools.guardrails().policy().per_tool_timeout;

        let calls = plan.admitted.iter().map(|call| async move {
            let content = match call.parsed_arguments() {
                Ok(arguments) => {
                    self.tools
                        .execute(ToolCallRequest {
                            namespaced_name: call.function.name.clone(),
                            arguments,
                            request_id: Some(request_id.to_string()),
                            deadline,
                        })
                        .await
                        .to_content()
                }
                Err(e) => {
                    tracing::warn!(request_id = %request_id, tool = %call.function.name, error = %e, "Invalid tool arguments");
                    json!({
                        "error": format!("invalid tool arguments: {e}"),
                        "kind": "invalid_arguments",
                    })
                    .to_string()
                }
            };
            tool_message(call, content)
        });

        let mut results = join_all(calls).await;
        results.extend(plan.rejected.iter().map(|(call, reason)| {
            tracing::warn!(request_id = %request_id, tool = %call.function.name, %reason, "Tool call rejected");
            tool_message(
                call,
                json!({ "error": reason, "kind": "policy_denied" }).to_string(),
            )
        }));
        results
    }
}

fn tool_message(call: &ToolCall, content: String) -> ChatMessage {
    let mut msg = ChatMessage::tool_result(call.id.clone(), content);
    msg.name = Some(call.function.name.clone());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendChatResponse, BackendMessage};
    use crate::mcp::testing::{FakeReply, FakeTransport};
    use crate::mcp::{ConnectionPool, McpServerConfig, PoolConfig, ServerManager, Transport};
    use crate::tools::Guardrails;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend that replays scripted replies and records what it was sent.
    #[derive(Debug, Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<BackendChatResponse, BackendError>>>,
        requests: Mutex<Vec<BackendChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<BackendChatResponse, BackendError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::default(),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, i: usize) -> BackendChatRequest {
            self.requests.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            request: &BackendChatRequest,
            _request_id: &str,
        ) -> Result<BackendChatResponse, BackendError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Malformed("script exhausted".into())))
        }
    }

    fn text_reply(text: &str) -> Result<BackendChatResponse, BackendError> {
        Ok(BackendChatResponse {
            message: Some(BackendMessage {
                role: "assistant".into(),
                content: text.into(),
                tool_calls: vec![],
            }),
            done: true,
            ..BackendChatResponse::default()
        })
    }

    fn tool_reply(text: &str, calls: &[(&str, Value)]) -> Result<BackendChatResponse, BackendError> {
        let value = json!({
            "message": {
                "role": "assistant",
                "content": text,
                "tool_calls": calls.iter().map(|(name, args)| json!({
                    "function": {"name": name, "arguments": args}
                })).collect::<Vec<_>>()
            },
            "done": true
        });
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn harness(
        fake: FakeTransport,
        policy: GuardrailPolicy,
        replies: Vec<Result<BackendChatResponse, BackendError>>,
    ) -> (ToolLoop, Arc<ScriptedBackend>, Arc<FakeTransport>) {
        let servers = Arc::new(ServerManager::new(Arc::new(ConnectionPool::new(
            PoolConfig::default(),
        ))));
        let fake = Arc::new(fake);
        servers
            .register(
                McpServerConfig::stdio("files", "unused", vec![]),
                Arc::clone(&fake) as Arc<dyn Transport>,
            )
            .unwrap()
            .establish()
            .await
            .unwrap();
        let tools = Arc::new(ToolManager::new(
            servers,
            Arc::new(Guardrails::new(policy).unwrap()),
        ));
        let backend = Arc::new(ScriptedBackend::new(replies));
        (
            ToolLoop::new(Arc::clone(&backend) as Arc<dyn ChatBackend>, tools),
            backend,
            fake,
        )
    }

    fn request(text: &str) -> ToolLoopRequest {
        ToolLoopRequest {
            model: "llama3".into(),
            messages: vec![ChatMessage::user(text)],
            temperature: None,
            max_tokens: None,
            request_id: "req-loop".into(),
        }
    }

    fn policy() -> GuardrailPolicy {
        GuardrailPolicy::default()
    }

    fn tool_messages(req: &BackendChatRequest) -> Vec<&BackendMessage> {
        req.messages.iter().filter(|m| m.role == "tool").collect()
    }

    #[test]
    fn test_state_transitions() {
        let mut state = ToolLoopState::new(vec![ChatMessage::user("hi")], &policy());
        assert_eq!(state.phase(), LoopPhase::AwaitingModel);

        let mut reply = ChatMessage::assistant("");
        reply.tool_calls = Some(vec![ToolCall::new("mcp.files.read", &json!({}))]);
        let plan = state.on_model_reply(reply).unwrap();
        assert_eq!(plan.admitted.len(), 1);
        assert_eq!(state.phase(), LoopPhase::AwaitingTools);
        assert_eq!(state.call_budget_remaining(), 49);

        state.on_tools_resolved(vec![ChatMessage::tool_result(&plan.admitted[0].id, "ok")]);
        assert_eq!(state.phase(), LoopPhase::AwaitingModel);
        assert_eq!(state.round(), 1);

        assert!(state.on_model_reply(ChatMessage::assistant("done")).is_none());
        assert_eq!(state.phase(), LoopPhase::Done);
        assert_eq!(state.termination_reason(), Some(TerminationReason::Completed));
        assert_eq!(state.final_message().text(), "done");
        assert_eq!(state.messages().len(), 4);
    }

    #[test]
    fn test_state_splits_round_over_cap() {
        let mut state = ToolLoopState::new(
            vec![],
            &GuardrailPolicy {
                max_calls_per_round: 2,
                ..policy()
            },
        );
        let mut reply = ChatMessage::assistant("");
        reply.tool_calls = Some(
            ["a", "b", "c"]
                .iter()
                .map(|n| ToolCall::new(format!("mcp.files.{n}"), &json!({})))
                .collect(),
        );
        let plan = state.on_model_reply(reply).unwrap();
        let admitted: Vec<_> = plan.admitted.iter().map(|c| c.function.name.as_str()).collect();
        assert_eq!(admitted, vec!["mcp.files.a", "mcp.files.b"]);
        assert_eq!(plan.rejected.len(), 1);
        assert!(plan.rejected[0].1.contains("per round"));
    }

    #[tokio::test]
    async fn test_single_round_success() {
        let (tool_loop, backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read a file").on_tool(
                "read",
                FakeReply::Result(json!({"content": [{"type": "text", "text": "notes"}]})),
            ),
            policy(),
            vec![
                tool_reply("", &[("mcp.files.read", json!({"path": "/tmp/n"}))]),
                text_reply("The notes say: notes"),
            ],
        )
        .await;

        let outcome = tool_loop
            .run(request("read my notes"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.termination, TerminationReason::Completed);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.message.text(), "The notes say: notes");
        assert_eq!(fake.tool_calls(), vec!["read"]);

        let first = backend.request(0);
        assert_eq!(first.messages[0].role, "system");
        assert!(first.messages[0].content.contains("mcp.files.read"));
        assert_eq!(first.tools.len(), 1);

        let second = backend.request(1);
        assert_eq!(tool_messages(&second)[0].content, "notes");
    }

    #[tokio::test]
    async fn test_existing_system_message_is_kept() {
        let (tool_loop, backend, _fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            policy(),
            vec![text_reply("hello")],
        )
        .await;
        let mut req = request("hi");
        req.messages.insert(0, ChatMessage::system("be brief"));
        tool_loop.run(req, &CancellationToken::new()).await.unwrap();

        let sent = backend.request(0);
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[0].content, "be brief");
    }

    #[tokio::test]
    async fn test_denied_tool_becomes_content() {
        let (tool_loop, backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            GuardrailPolicy {
                deny_patterns: vec!["mcp.files.*".into()],
                ..policy()
            },
            vec![
                tool_reply("", &[("mcp.files.read", json!({}))]),
                text_reply("I cannot read files."),
            ],
        )
        .await;

        let outcome = tool_loop
            .run(request("read"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.termination, TerminationReason::Completed);
        assert_eq!(fake.count("tools/call"), 0);

        let second = backend.request(1);
        let denial: Value = serde_json::from_str(&tool_messages(&second)[0].content).unwrap();
        assert_eq!(denial["kind"], "policy_denied");
    }

    #[tokio::test]
    async fn test_round_cap_stops_before_second_round() {
        let (tool_loop, backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            GuardrailPolicy {
                max_rounds_per_request: 1,
                ..policy()
            },
            vec![
                tool_reply("Let me look.", &[("mcp.files.read", json!({"path": "a"}))]),
                tool_reply("One more.", &[("mcp.files.read", json!({"path": "b"}))]),
                text_reply("never reached"),
            ],
        )
        .await;

        let outcome = tool_loop
            .run(request("read twice"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.termination, TerminationReason::MaxRoundsReached);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.message.text(), "One more.");
        assert!(outcome.message.tool_calls.is_none());
        assert_eq!(fake.count("tools/call"), 1);
        assert_eq!(backend.calls(), 2);
        // Round one's result reached the model before the loop stopped.
        assert_eq!(tool_messages(&backend.request(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_total_budget_limit() {
        let (tool_loop, _backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            GuardrailPolicy {
                max_total_calls: 1,
                ..policy()
            },
            vec![
                tool_reply("", &[("mcp.files.read", json!({}))]),
                tool_reply("", &[("mcp.files.read", json!({}))]),
            ],
        )
        .await;

        let outcome = tool_loop
            .run(request("loop"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.termination, TerminationReason::MaxTotalCallsReached);
        assert_eq!(outcome.total_calls, 1);
        assert_eq!(fake.count("tools/call"), 1);
    }

    #[tokio::test]
    async fn test_calls_over_round_cap_are_rejected_without_running() {
        let (tool_loop, backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            GuardrailPolicy {
                max_calls_per_round: 1,
                ..policy()
            },
            vec![
                tool_reply(
                    "",
                    &[
                        ("mcp.files.read", json!({"path": "a"})),
                        ("mcp.files.read", json!({"path": "b"})),
                    ],
                ),
                text_reply("done"),
            ],
        )
        .await;

        tool_loop
            .run(request("two"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fake.count("tools/call"), 1);
        let second = backend.request(1);
        let tools = tool_messages(&second);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].content, "read ok");
        assert!(tools[1].content.contains("per round"));
    }

    #[tokio::test]
    async fn test_results_keep_request_order() {
        let (tool_loop, backend, _fake) = harness(
            FakeTransport::new()
                .with_tool("slow", "Slow")
                .with_tool("fast", "Fast")
                .on_tool(
                    "slow",
                    FakeReply::Delayed(
                        Duration::from_millis(50),
                        json!({"content": [{"type": "text", "text": "slow result"}]}),
                    ),
                ),
            policy(),
            vec![
                tool_reply(
                    "",
                    &[("mcp.files.slow", json!({})), ("mcp.files.fast", json!({}))],
                ),
                text_reply("both done"),
            ],
        )
        .await;

        tool_loop
            .run(request("both"), &CancellationToken::new())
            .await
            .unwrap();
        let second = backend.request(1);
        let contents: Vec<_> = tool_messages(&second)
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["slow result", "fast ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_tool_times_out_and_loop_continues() {
        let (tool_loop, backend, _fake) = harness(
            FakeTransport::new()
                .with_tool("slow", "Never answers")
                .on_tool("slow", FakeReply::Hang),
            GuardrailPolicy {
                per_tool_timeout: Duration::from_secs(2),
                ..policy()
            },
            vec![
                tool_reply("", &[("mcp.files.slow", json!({}))]),
                text_reply("The tool timed out."),
            ],
        )
        .await;

        let started = Instant::now();
        let outcome = tool_loop
            .run(request("slow"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(outcome.termination, TerminationReason::Completed);

        let second = backend.request(1);
        let result: Value = serde_json::from_str(&tool_messages(&second)[0].content).unwrap();
        assert_eq!(result["kind"], "timeout");
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_server() {
        let (tool_loop, backend, fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            policy(),
            vec![
                tool_reply("", &[("mcp.files.read", Value::String("{not json".into()))]),
                text_reply("sorry"),
            ],
        )
        .await;

        tool_loop
            .run(request("bad"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fake.count("tools/call"), 0);
        let second = backend.request(1);
        assert!(tool_messages(&second)[0].content.contains("invalid_arguments"));
    }

    #[tokio::test]
    async fn test_backend_failure_fails_loop() {
        let (tool_loop, _backend, _fake) = harness(
            FakeTransport::new().with_tool("read", "Read"),
            policy(),
            vec![Err(BackendError::Unreachable("connection refused".into()))],
        )
        .await;

        let err = tool_loop
            .run(request("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolLoopError::Backend(BackendError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_cancellation_drops_in_flight_calls() {
        let (tool_loop, _backend, _fake) = harness(
            FakeTransport::new()
                .with_tool("slow", "Slow")
                .on_tool("slow", FakeReply::Hang),
            policy(),
            vec![tool_reply("", &[("mcp.files.slow", json!({}))])],
        )
        .await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = tool_loop.run(request("slow"), &token).await.unwrap_err();
        assert!(matches!(err, ToolLoopError::Cancelled));
    }
}
