use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::catalog::{Catalog, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use super::error::{McpError, McpResult};
use super::protocol::{
    CallToolResult, GetPromptResult, InitializeResult, JsonRpcRequest, METHOD_NOT_FOUND,
    McpPrompt, McpResource, McpTool, PROTOCOL_VERSION, ReadResourceResult, ServerCapabilities,
};
use super::transport::{RequestContext, Transport, TransportKind};

/// Upper bound on pages fetched for one list call, against servers that
/// keep returning a cursor.
const MAX_LIST_PAGES: usize = 100;

/// MCP client bound to one server through one transport.
///
/// Ids are allocated here; correlation is the transport's job.
#[derive(Debug)]
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    next_id: AtomicU64,
    capabilities: RwLock<Option<ServerCapabilities>>,
}

impl McpClient {
    pub fn new(server_name: impl Into<String>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            timeout,
            next_id: AtomicU64::new(1),
            capabilities: RwLock::new(None),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn call(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        self.transport.request(request, ctx).await?.into_result()
    }

    /// Opens the transport and performs the initialize handshake.
    pub async fn connect(&self) -> McpResult<InitializeResult> {
        self.transport.connect().await?;
        self.initialize().await
    }

    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let ctx = RequestContext::new(self.timeout);
        let value = match self.call("initialize", Some(params), &ctx).await {
            Ok(v) => v,
            Err(McpError::Timeout(after)) => {
                return Err(McpError::Connection(format!(
                    "initialize handshake with '{}' timed out after {}ms",
                    self.server_name,
                    after.as_millis()
                )));
            }
            Err(e @ McpError::Rpc { .. }) => {
                return Err(McpError::Connection(format!(
                    "server '{}' rejected initialize: {e}",
                    self.server_name
                )));
            }
            Err(e) => return Err(e),
        };

        let result: InitializeResult = serde_json::from_value(value).map_err(McpError::protocol)?;
        *self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.capabilities.clone());

        self.transport
            .send(JsonRpcRequest::notification("notifications/initialized", None))
            .await?;

        tracing::info!(
            server = %self.server_name,
            protocol_version = %result.protocol_version,
            server_info = ?result.server_info.as_ref().map(|i| &i.name),
            "MCP handshake complete"
        );
        Ok(result)
    }

    async fn list_all<T: DeserializeOwned>(&self, method: &str, key: &str) -> McpResult<Vec<T>> {
        let ctx = RequestContext::new(self.timeout);
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let mut result = self.call(method, params, &ctx).await?;

            let items = result
                .get_mut(key)
                .map(Value::take)
                .ok_or_else(|| McpError::Protocol(format!("{method} result missing '{key}'")))?;
            let page: Vec<T> = serde_json::from_value(items).map_err(McpError::protocol)?;
            out.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(out);
            }
        }
        tracing::warn!(server = %self.server_name, method, "Stopped paginating after page limit");
        Ok(out)
    }

    /// Lists a kind the server may not support: an absent capability or a
    /// "method not found" reply yields an empty list.
    async fn list_optional<T: DeserializeOwned>(
        &self,
        declared: bool,
        method: &str,
        key: &str,
    ) -> McpResult<Vec<T>> {
        if !declared {
            return Ok(Vec::new());
        }
        match self.list_all(method, key).await {
            Err(McpError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => Ok(Vec::new()),
            other => other,
        }
    }

    /// Fetches the full catalog. Items keep the server's order, so running it
    /// twice against an unchanged server yields equal catalogs.
    pub async fn discover(&self) -> McpResult<Catalog> {
        // Servers that skipped the capabilities block are probed for everything.
        let caps = self.capabilities();
        let declares = |f: fn(&ServerCapabilities) -> bool| caps.as_ref().is_none_or(f);

        let tools: Vec<McpTool> = self
            .list_optional(declares(|c| c.tools.is_some()), "tools/list", "tools")
            .await?;
        let resources: Vec<McpResource> = match self
            .list_optional(declares(|c| c.resources.is_some()), "resources/list", "resources")
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(server = %self.server_name, error = %e, "Resource discovery failed");
                Vec::new()
            }
        };
        let prompts: Vec<McpPrompt> = match self
            .list_optional(declares(|c| c.prompts.is_some()), "prompts/list", "prompts")
            .await
        {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(server = %self.server_name, error = %e, "Prompt discovery failed");
                Vec::new()
            }
        };

        let catalog = Catalog {
            tools: tools
                .into_iter()
                .map(|t| ToolDescriptor::from_mcp(&self.server_name, t))
                .collect(),
            resources: resources
                .into_iter()
                .map(|r| ResourceDescriptor::from_mcp(&self.server_name, r))
                .collect(),
            prompts: prompts
                .into_iter()
                .map(|p| PromptDescriptor::from_mcp(&self.server_name, p))
                .collect(),
        };

        tracing::info!(
            server = %self.server_name,
            tools = catalog.tools.len(),
            resources = catalog.resources.len(),
            prompts = catalog.prompts.len(),
            "MCP discovery complete"
        );
        Ok(catalog)
    }

    /// Calls `name` (the server-local tool name).
    ///
    /// Fails with `Timeout` when no reply arrives in time, `Protocol` when the
    /// reply cannot be understood, and `Tool` when the tool reports failure.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
        request_id: Option<&str>,
    ) -> McpResult<CallToolResult> {
        let ctx = RequestContext::new(timeout).with_request_id(request_id);
        let value = self
            .call(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
                &ctx,
            )
            .await
            .map_err(|e| match e {
                McpError::Rpc { code, message } => {
                    McpError::Tool(format!("{message} (code {code})"))
                }
                other => other,
            })?;

        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("malformed tools/call result: {e}")))?;
        if result.is_error {
            return Err(McpError::Tool(result.text()));
        }
        Ok(result)
    }

    pub async fn read_resource(&self, uri: &str, timeout: Duration) -> McpResult<ReadResourceResult> {
        let ctx = RequestContext::new(timeout);
        let value = self
            .call("resources/read", Some(json!({ "uri": uri })), &ctx)
            .await
            .map_err(|e| match e {
                McpError::Rpc { message, .. } => McpError::NotFound(format!("resource '{uri}': {message}")),
                other => other,
            })?;
        serde_json::from_value(value).map_err(McpError::protocol)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> McpResult<GetPromptResult> {
        let ctx = RequestContext::new(self.timeout);
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = Value::Object(args);
        }
        let value = self
            .call("prompts/get", Some(params), &ctx)
            .await
            .map_err(|e| match e {
                McpError::Rpc { message, .. } => McpError::NotFound(format!("prompt '{name}': {message}")),
                other => other,
            })?;
        serde_json::from_value(value).map_err(McpError::protocol)
    }

    /// Liveness probe. Any well-formed reply counts, including an RPC error.
    pub async fn ping(&self, timeout: Duration) -> McpResult<()> {
        let ctx = RequestContext::new(timeout);
        match self.call("tools/list", None, &ctx).await {
            Ok(_) | Err(McpError::Rpc { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FakeReply, FakeTransport};

    fn client(transport: &Arc<FakeTransport>) -> McpClient {
        McpClient::new(
            "files",
            Arc::clone(transport) as Arc<dyn Transport>,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let t = Arc::new(FakeTransport::new().with_tool("read", "Read a file"));
        let c = client(&t);
        c.connect().await.unwrap();

        assert_eq!(t.notifications(), vec!["notifications/initialized".to_string()]);
        assert!(c.capabilities().unwrap().tools.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_timeout_is_connection_error() {
        let t = Arc::new(FakeTransport::new().on("initialize", FakeReply::Hang));
        let c = client(&t);
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_discover_skips_undeclared_kinds() {
        let t = Arc::new(
            FakeTransport::new()
                .with_tool("read", "Read a file")
                .with_capabilities(json!({"tools": {}})),
        );
        let c = client(&t);
        c.connect().await.unwrap();

        let catalog = c.discover().await.unwrap();
        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(catalog.tools[0].namespaced_name, "mcp.files.read");
        assert!(catalog.resources.is_empty());
        assert!(catalog.prompts.is_empty());
        assert_eq!(t.count("resources/list"), 0);
    }

    #[tokio::test]
    async fn test_discover_treats_method_not_found_as_empty() {
        let t = Arc::new(
            FakeTransport::new()
                .with_tool("read", "Read a file")
                .with_capabilities(json!({"tools": {}, "prompts": {}}))
                .on("prompts/list", FakeReply::Error(METHOD_NOT_FOUND, "Method not found".into())),
        );
        let c = client(&t);
        c.connect().await.unwrap();
        let catalog = c.discover().await.unwrap();
        assert!(catalog.prompts.is_empty());
        assert_eq!(t.count("prompts/list"), 1);
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let t = Arc::new(
            FakeTransport::new()
                .with_tool("read", "Read a file")
                .with_tool("write", "Write a file"),
        );
        let c = client(&t);
        c.connect().await.unwrap();
        let first = c.discover().await.unwrap();
        let second = c.discover().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_discover_follows_cursor() {
        let t = Arc::new(FakeTransport::new().on(
            "tools/list",
            FakeReply::Pages(vec![
                json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
                json!({"tools": [{"name": "b"}]}),
            ]),
        ));
        let c = client(&t);
        c.connect().await.unwrap();
        let catalog = c.discover().await.unwrap();
        let names: Vec<_> = catalog.tools.iter().map(|t| t.local_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_execute_tool_success() {
        let t = Arc::new(FakeTransport::new().with_tool("read", "Read a file").on_tool(
            "read",
            FakeReply::Result(json!({"content": [{"type": "text", "text": "hello"}]})),
        ));
        let c = client(&t);
        c.connect().await.unwrap();
        let result = c
            .execute_tool("read", json!({"path": "/tmp/x"}), Duration::from_secs(1), Some("r1"))
            .await
            .unwrap();
        assert_eq!(result.text(), "hello");
    }

    #[tokio::test]
    async fn test_execute_tool_error_kinds() {
        let t = Arc::new(
            FakeTransport::new()
                .on_tool(
                    "fails",
                    FakeReply::Result(json!({"content": [{"type": "text", "text": "disk full"}], "isError": true})),
                )
                .on_tool("garbled", FakeReply::Result(json!({"content": "not a list"})))
                .on_tool("rpc", FakeReply::Error(-32000, "exploded".into()))
                .on_tool("slow", FakeReply::Hang),
        );
        let c = client(&t);
        c.connect().await.unwrap();
        let run = |name: &'static str| c.execute_tool(name, json!({}), Duration::from_millis(50), None);

        assert!(matches!(run("fails").await, Err(McpError::Tool(m)) if m == "disk full"));
        assert!(matches!(run("garbled").await, Err(McpError::Protocol(_))));
        assert!(matches!(run("rpc").await, Err(McpError::Tool(_))));
        assert!(matches!(run("slow").await, Err(McpError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_read_resource_and_prompt() {
        let t = Arc::new(
            FakeTransport::new()
                .on(
                    "resources/read",
                    FakeReply::Result(json!({"contents": [{"uri": "notes.txt", "text": "remember"}]})),
                )
                .on(
                    "prompts/get",
                    FakeReply::Result(json!({"messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]})),
                ),
        );
        let c = client(&t);
        c.connect().await.unwrap();
        let res = c.read_resource("notes.txt", Duration::from_secs(1)).await.unwrap();
        assert_eq!(res.text(), "remember");
        let prompt = c.get_prompt("greet", None).await.unwrap();
        assert_eq!(prompt.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_accepts_rpc_errors() {
        let t = Arc::new(FakeTransport::new().on("tools/list", FakeReply::Error(METHOD_NOT_FOUND, "nope".into())));
        let c = client(&t);
        c.connect().await.unwrap();
        assert!(c.ping(Duration::from_secs(1)).await.is_ok());
    }
}
