//! Discovered tools, resources, and prompts, and the `mcp.<server>.<tool>`
//! naming scheme that keeps tool names unique across servers.

use serde::Serialize;
use serde_json::Value;

use super::protocol::{McpPrompt, McpResource, McpTool, PromptArgument};

pub const NAMESPACE_PREFIX: &str = "mcp";

/// `mcp.<server>.<tool>`. Server names never contain dots, so the first dot
/// after the prefix always separates server from tool.
pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{NAMESPACE_PREFIX}.{server}.{tool}")
}

/// Splits a namespaced name into `(server, tool)`.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(NAMESPACE_PREFIX)?.strip_prefix('.')?;
    let (server, tool) = rest.split_once('.')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub local_name: String,
    pub namespaced_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn from_mcp(server: &str, tool: McpTool) -> Self {
        Self {
            server_name: server.to_string(),
            namespaced_name: namespaced_name(server, &tool.name),
            local_name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    pub server_name: String,
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn from_mcp(server: &str, resource: McpResource) -> Self {
        Self {
            server_name: server.to_string(),
            uri: resource.uri,
            name: resource.name,
            description: resource.description.unwrap_or_default(),
            mime_type: resource.mime_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDescriptor {
    pub server_name: String,
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

impl PromptDescriptor {
    pub fn from_mcp(server: &str, prompt: McpPrompt) -> Self {
        Self {
            server_name: server.to_string(),
            name: prompt.name,
            description: prompt.description.unwrap_or_default(),
            arguments: prompt.arguments,
        }
    }
}

/// Everything one server exposes. Replaced wholesale on re-discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

impl Catalog {
    pub fn tool(&self, local_name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.local_name == local_name)
    }
}
