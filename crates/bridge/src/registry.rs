use std::collections::{HashMap, HashSet};

use crate::config::{BridgeConfig, ServerConfig};
use crate::error::BridgeError;

/// Joins a server name and a tool name: `{server}_{tool}`.
pub const QUALIFIED_NAME_SEPARATOR: char = '_';
/// Joins a server name and a resource uri: `{server}://{uri}`.
pub const RESOURCE_URI_SEPARATOR: &str = "://";

const LONG_RUNNING_HINTS: [&str; 2] = ["rag", "search"];

/// One registered backend tool server. Immutable after startup.
#[derive(Debug, Clone)]
pub struct BackendServer {
    pub name: String,
    pub base_url: String,
    pub rpc_path: String,
    pub display_name: String,
    pub description: String,
    long_running_tools: Option<HashSet<String>>,
}

impl BackendServer {
    #[must_use]
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            base_url: cfg.url.trim_end_matches('/').to_string(),
            rpc_path: cfg.rpc_path.clone(),
            display_name: cfg.display_name.clone().unwrap_or_else(|| cfg.name.clone()),
            description: cfg.description.clone(),
            long_running_tools: cfg
                .long_running_tools
                .as_ref()
                .map(|tools| tools.iter().cloned().collect()),
        }
    }

    #[must_use]
    pub fn rpc_url(&self) -> String {
        format!("{}{}", self.base_url, self.rpc_path)
    }

    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    /// Decide how a call to `tool` on this server is executed.
    ///
    /// An explicit `longRunningTools` declaration is authoritative. Without one, tools whose name
    /// contains "rag" or "search" (case-insensitive) run as background tasks.
    #[must_use]
    pub fn execution_mode(&self, tool: &str) -> ExecutionMode {
        let long_running = match &self.long_running_tools {
            Some(declared) => declared.contains(tool),
            None => {
                let lower = tool.to_ascii_lowercase();
                LONG_RUNNING_HINTS.iter().any(|hint| lower.contains(hint))
            }
        };
        if long_running {
            ExecutionMode::Background
        } else {
            ExecutionMode::Inline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Forward and wait for the backend result.
    Inline,
    /// Record a task, schedule it, and return a handle immediately.
    Background,
}

/// Ordered, read-only table of backend servers.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<BackendServer>,
    by_name: HashMap<String, usize>,
}

impl ServerRegistry {
    /// Build from a validated config. Iteration order is config order.
    #[must_use]
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(cfg.servers.iter().map(BackendServer::from_config).collect())
    }

    #[must_use]
    pub fn new(servers: Vec<BackendServer>) -> Self {
        let by_name = servers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { servers, by_name }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BackendServer> {
        self.by_name.get(name).map(|&i| &self.servers[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendServer> {
        self.servers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Split a qualified tool name at the first `_` and look up the owning server.
    pub fn resolve_tool<'a>(
        &'a self,
        qualified: &'a str,
    ) -> Result<(&'a BackendServer, &'a str), BridgeError> {
        let Some((server_name, tool)) = qualified.split_once(QUALIFIED_NAME_SEPARATOR) else {
            return Err(BridgeError::InvalidParams(format!(
                "tool name '{qualified}' is not qualified as '<server>_<tool>'"
            )));
        };
        if tool.is_empty() {
            return Err(BridgeError::InvalidParams(format!(
                "tool name '{qualified}' has an empty tool part"
            )));
        }
        let server = self
            .get(server_name)
            .ok_or_else(|| BridgeError::ToolNotFound(format!("unknown server '{server_name}'")))?;
        Ok((server, tool))
    }

    /// Split a qualified resource uri at the first `://` and look up the owning server.
    pub fn resolve_resource_uri<'a>(
        &'a self,
        qualified: &'a str,
    ) -> Result<(&'a BackendServer, &'a str), BridgeError> {
        let Some((server_name, uri)) = qualified.split_once(RESOURCE_URI_SEPARATOR) else {
            return Err(BridgeError::InvalidParams(format!(
                "resource uri '{qualified}' is not qualified as '<server>://<uri>'"
            )));
        };
        let server = self.get(server_name).ok_or_else(|| {
            BridgeError::ResourceNotFound(format!("unknown server '{server_name}'"))
        })?;
        Ok((server, uri))
    }
}

#[must_use]
pub fn qualify_tool_name(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIED_NAME_SEPARATOR}{tool}")
}

#[must_use]
pub fn qualify_resource_uri(server: &str, uri: &str) -> String {
    format!("{server}{RESOURCE_URI_SEPARATOR}{uri}")
}

#[cfg(test)]
pub(crate) fn test_server(name: &str, base_url: &str) -> BackendServer {
    BackendServer {
        name: name.to_string(),
        base_url: base_url.to_string(),
        rpc_path: crate::config::DEFAULT_RPC_PATH.to_string(),
        display_name: name.to_string(),
        description: String::new(),
        long_running_tools: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_bridge_protocol::ErrorCode;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(vec![
            test_server("A", "http://a"),
            test_server("B", "http://b"),
        ])
    }

    #[test]
    fn resolves_at_first_underscore() {
        let reg = registry();
        let (server, tool) = reg.resolve_tool("A_search_docs").expect("resolve");
        assert_eq!(server.name, "A");
        assert_eq!(tool, "search_docs");
    }

    #[test]
    fn qualified_names_round_trip_for_every_registered_server() {
        let reg = registry();
        for s in reg.iter() {
            for t in ["x", "fetch_url", "a_b_c"] {
                let q = qualify_tool_name(&s.name, t);
                let (server, tool) = reg.resolve_tool(&q).expect("resolve");
                assert_eq!((server.name.as_str(), tool), (s.name.as_str(), t));
            }
        }
    }

    #[test]
    fn missing_underscore_is_invalid_params() {
        let err = registry().resolve_tool("noserver").expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn empty_tool_part_is_invalid_params() {
        let err = registry().resolve_tool("A_").expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn unknown_server_is_tool_not_found() {
        let err = registry().resolve_tool("C_x").expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::TOOL_NOT_FOUND);
    }

    #[test]
    fn resource_uri_resolution() {
        let reg = registry();
        let (server, uri) = reg.resolve_resource_uri("B://file:///tmp/a").expect("resolve");
        assert_eq!(server.name, "B");
        assert_eq!(uri, "file:///tmp/a");

        let err = reg.resolve_resource_uri("plain").expect_err("no separator");
        assert_eq!(err.code(), ErrorCode::INVALID_PARAMS);
        let err = reg.resolve_resource_uri("Z://x").expect_err("unknown");
        assert_eq!(err.code(), ErrorCode::RESOURCE_NOT_FOUND);
    }

    #[test]
    fn heuristic_classification_is_case_insensitive() {
        let s = test_server("A", "http://a");
        assert_eq!(s.execution_mode("search_docs"), ExecutionMode::Background);
        assert_eq!(s.execution_mode("WebSEARCH"), ExecutionMode::Background);
        assert_eq!(s.execution_mode("RAG_query"), ExecutionMode::Background);
        assert_eq!(s.execution_mode("fetch_url"), ExecutionMode::Inline);
    }

    #[test]
    fn declared_long_running_tools_override_heuristic() {
        let mut s = test_server("A", "http://a");
        s.long_running_tools = Some(["crawl".to_string()].into_iter().collect());
        assert_eq!(s.execution_mode("crawl"), ExecutionMode::Background);
        assert_eq!(s.execution_mode("research_notes"), ExecutionMode::Inline);
    }

    #[test]
    fn registry_preserves_config_order() {
        let reg = registry();
        let names: Vec<_> = reg.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn trailing_slash_is_trimmed_from_base_url() {
        let cfg = crate::config::parse(
            br"
servers:
  - name: web
    url: http://localhost:8001/
",
        )
        .expect("parse");
        let reg = ServerRegistry::from_config(&cfg);
        let web = reg.get("web").expect("web");
        assert_eq!(web.rpc_url(), "http://localhost:8001/mcp");
        assert_eq!(web.health_url(), "http://localhost:8001/health");
        assert_eq!(web.display_name, "web");
    }
}
