use crate::cache::CacheConfig;
use crate::mcp::{HealthConfig, PoolConfig, RetryPolicy};
use crate::tools::GuardrailPolicy;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::{env, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (toml, yaml, or json)
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Base URL of the inference backend
    #[arg(long, env = "OLLAMA_HOST")]
    pub ollama_host: Option<String>,

    /// Enable MCP tool servers
    #[arg(long, env = "MCP_ENABLED")]
    pub mcp_enabled: Option<bool>,

    /// Path to the MCP servers file (`mcpServers` JSON)
    #[arg(long, env = "MCP_SERVERS_FILE")]
    pub mcp_servers_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub mcp: McpConfig,
    pub cache: CacheSettings,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    pub enabled: bool,
    #[serde(default)]
    pub servers_file: Option<String>,
    #[serde(default)]
    pub allow_tools: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    pub max_tool_rounds: usize,
    pub max_tool_calls_per_round: usize,
    pub max_total_tool_calls: usize,
    pub default_tool_timeout_secs: u64,
    pub max_tool_result_size: usize,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub resource_fetch_timeout_secs: u64,
    pub pool_size: usize,
    pub pool_idle_secs: u64,
    pub pool_acquire_timeout_secs: u64,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `compact` or `json`.
    pub format: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 11435)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.request_timeout_secs", 300)?
            .set_default("backend.host", "http://localhost:11434")?
            .set_default("backend.timeout_secs", 300)?
            .set_default("mcp.enabled", false)?
            .set_default("mcp.max_tool_rounds", 10)?
            .set_default("mcp.max_tool_calls_per_round", 10)?
            .set_default("mcp.max_total_tool_calls", 50)?
            .set_default("mcp.default_tool_timeout_secs", 30)?
            .set_default("mcp.max_tool_result_size", 1024 * 1024)?
            .set_default("mcp.health_interval_secs", 60)?
            .set_default("mcp.health_timeout_secs", 5)?
            .set_default("mcp.resource_fetch_timeout_secs", 30)?
            .set_default("mcp.pool_size", 10)?
            .set_default("mcp.pool_idle_secs", 300)?
            .set_default("mcp.pool_acquire_timeout_secs", 30)?
            .set_default("mcp.connect_attempts", 3)?
            .set_default("mcp.connect_backoff_ms", 500)?
            .set_default("cache.enabled", true)?
            .set_default("cache.ttl_secs", 300)?
            .set_default("cache.max_entries", 1000)?
            .set_default("cache.sweep_interval_secs", 60)?
            .set_default("log.format", "compact")?;

        // An explicit file must exist; the working-directory fallback is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("toolgate").required(false)),
        };

        // TOOLGATE_SERVER__PORT=8080, TOOLGATE_MCP__DENY_TOOLS=a,b
        builder = builder.add_source(
            Environment::with_prefix("TOOLGATE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mcp.allow_tools")
                .with_list_parse_key("mcp.deny_tools")
                .try_parsing(true),
        );

        if let Some(list) = env_list("MCP_ALLOW_TOOLS") {
            builder = builder.set_override("mcp.allow_tools", list)?;
        }
        if let Some(list) = env_list("MCP_DENY_TOOLS") {
            builder = builder.set_override("mcp.deny_tools", list)?;
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            builder = builder.set_override("log.format", format)?;
        }

        // CLI flags and their env vars win over everything else.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(host) = cli.ollama_host {
            builder = builder.set_override("backend.host", host)?;
        }
        if let Some(enabled) = cli.mcp_enabled {
            builder = builder.set_override("mcp.enabled", enabled)?;
        }
        if let Some(file) = cli.mcp_servers_file {
            builder = builder.set_override("mcp.servers_file", file)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let positive = [
            ("mcp.max_tool_rounds", self.mcp.max_tool_rounds),
            ("mcp.max_tool_calls_per_round", self.mcp.max_tool_calls_per_round),
            ("mcp.max_total_tool_calls", self.mcp.max_total_tool_calls),
            ("mcp.max_tool_result_size", self.mcp.max_tool_result_size),
            ("mcp.pool_size", self.mcp.pool_size),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(config::ConfigError::Message(format!("{key} must be positive")));
        }
        let positive_secs = [
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("backend.timeout_secs", self.backend.timeout_secs),
            ("mcp.default_tool_timeout_secs", self.mcp.default_tool_timeout_secs),
            ("mcp.health_interval_secs", self.mcp.health_interval_secs),
            ("mcp.health_timeout_secs", self.mcp.health_timeout_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
        ];
        if let Some((key, _)) = positive_secs.iter().find(|(_, v)| *v == 0) {
            return Err(config::ConfigError::Message(format!("{key} must be positive")));
        }
        if url::Url::parse(&self.backend.host).is_err() {
            return Err(config::ConfigError::Message(format!(
                "backend.host is not a valid URL: {}",
                self.backend.host
            )));
        }
        Ok(())
    }

    pub fn guardrail_policy(&self) -> GuardrailPolicy {
        GuardrailPolicy {
            allow_patterns: self.mcp.allow_tools.clone(),
            deny_patterns: self.mcp.deny_tools.clone(),
            per_tool_timeout: Duration::from_secs(self.mcp.default_tool_timeout_secs),
            max_result_size: self.mcp.max_tool_result_size,
            max_rounds_per_request: self.mcp.max_tool_rounds,
            max_calls_per_round: self.mcp.max_tool_calls_per_round,
            max_total_calls: self.mcp.max_total_tool_calls,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_entries: self.cache.max_entries,
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.mcp.health_interval_secs),
            timeout: Duration::from_secs(self.mcp.health_timeout_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.mcp.pool_size,
            max_idle: Duration::from_secs(self.mcp.pool_idle_secs),
            acquire_timeout: Duration::from_secs(self.mcp.pool_acquire_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.mcp.connect_attempts,
            initial_backoff: Duration::from_millis(self.mcp.connect_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }

    pub fn resource_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.mcp.resource_fetch_timeout_secs)
    }
}

/// Comma- or space-separated list from a plain env var; unset or blank means none.
fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}
