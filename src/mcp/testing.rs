//! Scripted in-memory transport for unit tests.

use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::error::{McpError, McpResult};
use super::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use super::transport::{RequestContext, Transport, TransportKind};

#[derive(Debug, Clone)]
pub enum FakeReply {
    Result(Value),
    Error(i64, String),
    /// Never answers; the call times out.
    Hang,
    /// Answers after the delay.
    Delayed(Duration, Value),
    /// Answers with an envelope that carries neither result nor error.
    Malformed,
    /// Successive calls get successive pages; the last one repeats.
    Pages(Vec<Value>),
}

#[derive(Debug, Default)]
struct Script {
    capabilities: Option<Value>,
    tools: Vec<Value>,
    methods: HashMap<String, FakeReply>,
    tool_replies: HashMap<String, FakeReply>,
    page_cursor: HashMap<String, usize>,
    requests: Vec<(String, Option<Value>)>,
    notifications: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    script: Mutex<Script>,
    open: AtomicBool,
    unreachable: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_tool(self, name: &str, description: &str) -> Self {
        self.script().tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }));
        self
    }

    #[must_use]
    pub fn with_capabilities(self, caps: Value) -> Self {
        self.script().capabilities = Some(caps);
        self
    }

    #[must_use]
    pub fn on(self, method: &str, reply: FakeReply) -> Self {
        self.set_reply(method, reply);
        self
    }

    #[must_use]
    pub fn on_tool(self, tool: &str, reply: FakeReply) -> Self {
        self.set_tool_reply(tool, reply);
        self
    }

    pub fn set_reply(&self, method: &str, reply: FakeReply) {
        self.script().methods.insert(method.to_string(), reply);
    }

    pub fn set_tool_reply(&self, tool: &str, reply: FakeReply) {
        self.script().tool_replies.insert(tool.to_string(), reply);
    }

    pub fn set_tools(&self, names: &[&str]) {
        self.script().tools = names
            .iter()
            .map(|n| json!({"name": n, "description": format!("{n} tool")}))
            .collect();
    }

    /// Simulates a dead server: connect and every request fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn count(&self, method: &str) -> usize {
        self.script()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Names passed to `tools/call`, in call order.
    pub fn tool_calls(&self) -> Vec<String> {
        self.script()
            .requests
            .iter()
            .filter(|(m, _)| m == "tools/call")
            .filter_map(|(_, p)| p.as_ref()?.get("name")?.as_str().map(str::to_string))
            .collect()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.script().notifications.clone()
    }

    fn default_reply(script: &Script, message: &JsonRpcRequest) -> FakeReply {
        match message.method.as_str() {
            "initialize" => FakeReply::Result(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": script.capabilities.clone().unwrap_or_else(
                    || json!({"tools": {}, "resources": {}, "prompts": {}})
                ),
                "serverInfo": {"name": "fake", "version": "0.0.0"}
            })),
            "tools/list" => FakeReply::Result(json!({ "tools": script.tools })),
            "resources/list" => FakeReply::Result(json!({ "resources": [] })),
            "prompts/list" => FakeReply::Result(json!({ "prompts": [] })),
            "tools/call" => {
                let name = message
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                FakeReply::Result(json!({
                    "content": [{"type": "text", "text": format!("{name} ok")}]
                }))
            }
            other => FakeReply::Error(-32601, format!("Method not found: {other}")),
        }
    }

    fn pick_reply(&self, message: &JsonRpcRequest) -> FakeReply {
        let mut script = self.script();
        script
            .requests
            .push((message.method.clone(), message.params.clone()));

        let scripted = if message.method == "tools/call" {
            let tool = message
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            script.tool_replies.get(tool).cloned()
        } else {
            script.methods.get(&message.method).cloned()
        };

        match scripted {
            Some(FakeReply::Pages(pages)) => {
                let idx = script.page_cursor.entry(message.method.clone()).or_insert(0);
                let page = pages
                    .get(*idx)
                    .or_else(|| pages.last())
                    .cloned()
                    .unwrap_or(Value::Null);
                *idx += 1;
                FakeReply::Result(page)
            }
            Some(reply) => reply,
            None => Self::default_reply(&script, message),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(McpError::Connection("fake server unreachable".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcRequest) -> McpResult<()> {
        self.script().notifications.push(message.method);
        Ok(())
    }

    async fn request(
        &self,
        message: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(McpError::Connection("fake server unreachable".into()));
        }
        let id = message.id.unwrap_or_default();
        match self.pick_reply(&message) {
            FakeReply::Result(v) => Ok(JsonRpcResponse::success(id, v)),
            FakeReply::Error(code, msg) => Ok(JsonRpcResponse::failure(id, code, msg)),
            FakeReply::Hang => {
                tokio::time::sleep(ctx.timeout).await;
                Err(McpError::Timeout(ctx.timeout))
            }
            FakeReply::Delayed(delay, v) => {
                if delay >= ctx.timeout {
                    tokio::time::sleep(ctx.timeout).await;
                    return Err(McpError::Timeout(ctx.timeout));
                }
                tokio::time::sleep(delay).await;
                Ok(JsonRpcResponse::success(id, v))
            }
            FakeReply::Malformed => Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: Some(Value::from(id)),
                result: None,
                error: None,
            }),
            FakeReply::Pages(_) => unreachable!("pages are resolved in pick_reply"),
        }
    }

    async fn close(&self) -> McpResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }
}
