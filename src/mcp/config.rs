//! Tool server definitions, loaded from an `mcp.json` file.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"] },
//!     "search": { "url": "http://localhost:9000/mcp", "headers": { "Authorization": "Bearer ${SEARCH_TOKEN}" } },
//!     "events": { "transport": "sse", "url": "http://localhost:9001/sse" }
//!   }
//! }
//! ```
//!
//! The transport is inferred from the entry (`command` means stdio, `url`
//! means HTTP) unless `transport` is given explicitly.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    time::Duration,
};
use thiserror::Error;

use super::transport::TransportKind;

const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("failed to read MCP server file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse MCP server file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid MCP server '{server}': {reason}")]
    Invalid { server: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

/// Raw entry as written in the file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct McpServerEntry {
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

/// Validated per-server configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            enabled: true,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            enabled: true,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_entry(name: &str, entry: McpServerEntry) -> Result<Self, ServerConfigError> {
        let invalid = |reason: &str| ServerConfigError::Invalid {
            server: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("server name is required"));
        }
        // Dots would make `mcp.<server>.<tool>` ambiguous.
        if name.contains('.') || name.chars().any(char::is_whitespace) {
            return Err(invalid("server name must not contain dots or whitespace"));
        }

        let transport = match (entry.transport, &entry.command, &entry.url) {
            (Some(kind), _, _) => kind,
            (None, Some(_), _) => TransportKind::Stdio,
            (None, None, Some(_)) => TransportKind::Http,
            (None, None, None) => return Err(invalid("either 'command' or 'url' is required")),
        };

        match transport {
            TransportKind::Stdio if entry.command.as_deref().is_none_or(str::is_empty) => {
                return Err(invalid("command is required for stdio transport"));
            }
            TransportKind::Http | TransportKind::Sse
                if entry.url.as_deref().is_none_or(str::is_empty) =>
            {
                return Err(invalid("url is required for http and sse transports"));
            }
            _ => {}
        }

        let timeout_secs = match entry.timeout_secs {
            Some(0) | None => DEFAULT_SERVER_TIMEOUT_SECS,
            Some(secs) => secs,
        };

        Ok(Self {
            name: name.to_string(),
            transport,
            enabled: entry.enabled,
            command: entry.command,
            args: entry.args,
            env: entry.env,
            url: entry.url.map(|u| expand_env_placeholders(&u)),
            headers: expand_env_map(&entry.headers),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

pub fn parse_servers(json: &str) -> Result<Vec<McpServerConfig>, ServerConfigError> {
    let file: McpServersFile = serde_json::from_str(json)?;
    file.mcp_servers
        .into_iter()
        .map(|(name, entry)| McpServerConfig::from_entry(&name, entry))
        .collect()
}

pub fn load_servers(path: impl AsRef<Path>) -> Result<Vec<McpServerConfig>, ServerConfigError> {
    let txt = fs::read_to_string(path)?;
    parse_servers(&txt)
}

/// Expand "${VAR}" placeholders from the process environment.
/// Missing variables leave the placeholder unchanged.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = input.to_string();
    for (k, v) in std::env::vars() {
        let needle = format!("${{{k}}}");
        if out.contains(&needle) {
            out = out.replace(&needle, &v);
        }
    }
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_inferred() {
        let servers = parse_servers(
            r#"{"mcpServers": {
                "files": {"command": "cat"},
                "search": {"url": "http://localhost:9000/mcp", "timeout_secs": 5}
            }}"#,
        )
        .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "files");
        assert_eq!(servers[0].transport, TransportKind::Stdio);
        assert_eq!(servers[1].transport, TransportKind::Http);
        assert_eq!(servers[1].timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_explicit_sse_requires_url() {
        let err = parse_servers(r#"{"mcpServers": {"events": {"transport": "sse"}}}"#).unwrap_err();
        assert!(matches!(err, ServerConfigError::Invalid { .. }));
    }

    #[test]
    fn test_dotted_server_name_rejected() {
        let err = parse_servers(r#"{"mcpServers": {"a.b": {"command": "cat"}}}"#).unwrap_err();
        assert!(err.to_string().contains("dots"));
    }

    #[test]
    fn test_zero_timeout_falls_back_to_default() {
        let servers =
            parse_servers(r#"{"mcpServers": {"files": {"command": "cat", "timeout_secs": 0}}}"#)
                .unwrap();
        assert_eq!(servers[0].timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_expand_leaves_unknown_placeholders() {
        assert_eq!(
            expand_env_placeholders("${TOOLGATE_SURELY_UNSET_VAR}"),
            "${TOOLGATE_SURELY_UNSET_VAR}"
        );
    }
}
