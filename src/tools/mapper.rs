//! MCP tool descriptors to `OpenAI` function tools.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::mcp::ToolDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Pure and deterministic: equal descriptors always map to equal tools.
pub fn to_openai_function(tool: &ToolDescriptor) -> FunctionTool {
    let parameters = match &tool.input_schema {
        Value::Object(map) if !map.is_empty() => tool.input_schema.clone(),
        _ => empty_schema(),
    };
    FunctionTool {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: tool.namespaced_name.clone(),
            description: tool.description.clone(),
            parameters,
        },
    }
}

pub fn to_openai_tools(tools: &[ToolDescriptor]) -> Vec<FunctionTool> {
    tools.iter().map(to_openai_function).collect()
}
