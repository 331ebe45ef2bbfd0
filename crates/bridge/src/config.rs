use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::registry::{QUALIFIED_NAME_SEPARATOR, RESOURCE_URI_SEPARATOR};

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_RPC_PATH: &str = "/mcp";

/// Bridge configuration file (YAML).
///
/// The server list is ordered: aggregation results follow the order servers appear here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            servers: Vec::new(),
            tasks: TaskConfig::default(),
            sessions: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    /// Base URL, e.g. `http://localhost:8001`. The RPC path and `/health` are appended.
    pub url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    /// Tools this server runs as background tasks. When omitted, a name heuristic applies.
    #[serde(default)]
    pub long_running_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default = "default_task_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_task_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_task_ttl_secs(),
            workers: default_task_workers(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default)]
    pub list_secs: Option<u64>,
    #[serde(default)]
    pub call_secs: Option<u64>,
    #[serde(default)]
    pub health_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default)]
    pub algorithm: JwtAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwtAlgorithm {
    #[default]
    HS256,
    HS384,
    HS512,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_rpc_path() -> String {
    DEFAULT_RPC_PATH.to_string()
}

fn default_task_ttl_secs() -> u64 {
    300
}

fn default_task_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_session_ttl_secs() -> u64 {
    1800
}

/// Load, env-expand and validate a config file.
pub async fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read config file: {}", path.display()))?;
    parse(&bytes).with_context(|| format!("load config: {}", path.display()))
}

/// Parse config bytes. `${VAR}` references inside string values are expanded before the typed
/// decode, so any field may be supplied through the environment.
pub fn parse(bytes: &[u8]) -> anyhow::Result<BridgeConfig> {
    let mut raw: serde_yaml::Value = serde_yaml::from_slice(bytes).context("parse YAML config")?;
    if raw.is_null() {
        raw = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    expand_env_values(&mut raw)?;
    let cfg: BridgeConfig = serde_yaml::from_value(raw).context("decode config")?;
    cfg.validate()?;
    Ok(cfg)
}

fn expand_env_values(value: &mut serde_yaml::Value) -> anyhow::Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_env_string(s)?;
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_env_values(item)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_values(v)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => expand_env_values(&mut tagged.value)?,
        serde_yaml::Value::Null | serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_) => {}
    }
    Ok(())
}

/// Replace every `${VAR}` with the variable's value. Unterminated references are left as-is.
pub fn expand_env_string(input: &str) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = std::env::var(name)
            .with_context(|| format!("environment variable '{name}' not set (referenced in config)"))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl BridgeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            let name = server.name.as_str();
            anyhow::ensure!(!name.trim().is_empty(), "server name must not be empty");
            anyhow::ensure!(
                !name.contains(QUALIFIED_NAME_SEPARATOR),
                "server name '{name}' must not contain '{QUALIFIED_NAME_SEPARATOR}' (tool names are split at the first one)"
            );
            anyhow::ensure!(
                !name.contains(RESOURCE_URI_SEPARATOR),
                "server name '{name}' must not contain '{RESOURCE_URI_SEPARATOR}'"
            );
            anyhow::ensure!(seen.insert(name), "duplicate server name '{name}'");

            let url = reqwest::Url::parse(&server.url)
                .with_context(|| format!("server '{name}': invalid url '{}'", server.url))?;
            anyhow::ensure!(
                matches!(url.scheme(), "http" | "https"),
                "server '{name}': url must be http(s), got '{}'",
                server.url
            );
            anyhow::ensure!(
                server.rpc_path.starts_with('/'),
                "server '{name}': rpcPath must start with '/'"
            );
        }

        anyhow::ensure!(self.tasks.ttl_secs > 0, "tasks.ttlSecs must be > 0");
        anyhow::ensure!(self.tasks.workers > 0, "tasks.workers must be > 0");
        anyhow::ensure!(self.tasks.queue_capacity > 0, "tasks.queueCapacity must be > 0");
        anyhow::ensure!(
            self.tasks.sweep_interval_secs > 0,
            "tasks.sweepIntervalSecs must be > 0"
        );
        anyhow::ensure!(self.sessions.ttl_secs > 0, "sessions.ttlSecs must be > 0");

        if let Some(jwt) = &self.auth.jwt {
            anyhow::ensure!(!jwt.secret.is_empty(), "auth.jwt.secret must not be empty");
        }
        let mut keys = HashSet::new();
        for k in &self.auth.api_keys {
            anyhow::ensure!(!k.key.is_empty(), "auth.apiKeys: key must not be empty");
            anyhow::ensure!(
                keys.insert(k.key.as_str()),
                "auth.apiKeys: duplicate key for user '{}'",
                k.user_id
            );
        }
        Ok(())
    }
}
