use futures::future::join_all;
use mcp_bridge_protocol::{ResourceDescriptor, ToolDescriptor};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::registry::{BackendServer, ServerRegistry, qualify_resource_uri, qualify_tool_name};
use crate::transport::{BackendTransport, TransportError};

/// Per-backend outcome of a fan-out call.
pub struct Tagged<'a, T> {
    pub server: &'a BackendServer,
    pub result: Result<T, TransportError>,
}

/// Successes in registry order plus the servers that were skipped.
#[derive(Debug)]
pub struct Aggregated<T> {
    pub items: Vec<T>,
    pub failures: Vec<(String, String)>,
}

/// Call `method` on every backend at once, each bounded by `timeout`.
///
/// Results come back in registry order regardless of completion order.
pub async fn fan_out<'a>(
    registry: &'a ServerRegistry,
    transport: &dyn BackendTransport,
    method: &str,
    timeout: Duration,
) -> Vec<Tagged<'a, Value>> {
    let calls = registry.iter().map(|server| async move {
        Tagged {
            server,
            result: transport.call(server, method, None, timeout).await,
        }
    });
    join_all(calls).await
}

/// Fold tagged results: map successes through `extract`, log and skip failures.
///
/// A result `extract` cannot make sense of counts as a failure of that backend.
pub fn fold<T>(
    method: &str,
    tagged: Vec<Tagged<'_, Value>>,
    extract: impl Fn(&BackendServer, &Value) -> Result<Vec<T>, TransportError>,
) -> Aggregated<T> {
    let mut items = Vec::new();
    let mut failures = Vec::new();
    for Tagged { server, result } in tagged {
        match result.and_then(|value| extract(server, &value)) {
            Ok(extracted) => items.extend(extracted),
            Err(e) => {
                tracing::warn!(
                    server = %server.name,
                    method,
                    error = %e,
                    "backend skipped during aggregation"
                );
                failures.push((server.name.clone(), e.to_string()));
            }
        }
    }
    Aggregated { items, failures }
}

fn list_member<'v>(result: &'v Value, member: &str) -> Result<&'v [Value], TransportError> {
    result
        .get(member)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| TransportError::MalformedBody(format!("result has no `{member}` array")))
}

/// Namespace one backend's `tools/list` result.
#[must_use]
pub fn namespace_tools(
    server: &BackendServer,
    result: &Value,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    Ok(list_member(result, "tools")?
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            Some(ToolDescriptor {
                name: qualify_tool_name(&server.name, name),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                server: server.name.clone(),
                input_schema: tool
                    .get("inputSchema")
                    .filter(|s| !s.is_null())
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
            })
        })
        .collect())
}

/// Namespace one backend's `resources/list` result.
#[must_use]
pub fn namespace_resources(
    server: &BackendServer,
    result: &Value,
) -> Result<Vec<ResourceDescriptor>, TransportError> {
    Ok(list_member(result, "resources")?
        .iter()
        .filter_map(|res| {
            let uri = res.get("uri").and_then(Value::as_str)?;
            let name = res.get("name").and_then(Value::as_str).unwrap_or(uri);
            Some(ResourceDescriptor {
                uri: qualify_resource_uri(&server.name, uri),
                name: format!("[{}] {name}", server.name),
                description: res
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                mime_type: res
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect())
}

pub async fn list_tools(
    registry: &ServerRegistry,
    transport: &dyn BackendTransport,
    timeout: Duration,
) -> Aggregated<ToolDescriptor> {
    let tagged = fan_out(registry, transport, "tools/list", timeout).await;
    fold("tools/list", tagged, namespace_tools)
}

pub async fn list_resources(
    registry: &ServerRegistry,
    transport: &dyn BackendTransport,
    timeout: Duration,
) -> Aggregated<ResourceDescriptor> {
    let tagged = fan_out(registry, transport, "resources/list", timeout).await;
    fold("resources/list", tagged, namespace_resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::FnTransport;
    use crate::registry::test_server;
    use serde_json::json;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(vec![
            test_server("A", "http://a"),
            test_server("B", "http://b"),
            test_server("C", "http://c"),
        ])
    }

    #[tokio::test]
    async fn failing_backend_is_excluded() {
        let transport = FnTransport::new(|server: &BackendServer, _: &str, _: Option<&Value>| {
            match server.name.as_str() {
                "A" => Ok(json!({"tools": [{"name": "x"}]})),
                "B" => Err(TransportError::Timeout(Duration::from_secs(30))),
                _ => Err(TransportError::Status { status: 500 }),
            }
        });
        let out = list_tools(&registry(), &transport, Duration::from_secs(30)).await;
        assert_eq!(
            out.items,
            vec![ToolDescriptor {
                name: "A_x".into(),
                description: String::new(),
                server: "A".into(),
                input_schema: json!({}),
            }]
        );
        let failed: Vec<_> = out.failures.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(failed, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn all_backends_down_yields_empty_list() {
        let transport = FnTransport::new(|_: &BackendServer, _: &str, _: Option<&Value>| {
            Err(TransportError::Network("connection refused".into()))
        });
        let out = list_tools(&registry(), &transport, Duration::from_secs(1)).await;
        assert!(out.items.is_empty());
        assert_eq!(out.failures.len(), 3);
    }

    #[tokio::test]
    async fn order_follows_registry_then_backend() {
        let transport = FnTransport::new(|server: &BackendServer, _: &str, _: Option<&Value>| {
            let tools: Vec<Value> = ["z", "a"]
                .iter()
                .map(|t| json!({"name": format!("{}{t}", server.name.to_lowercase())}))
                .collect();
            Ok(json!({ "tools": tools }))
        });
        let out = list_tools(&registry(), &transport, Duration::from_secs(1)).await;
        let names: Vec<_> = out.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A_az", "A_aa", "B_bz", "B_ba", "C_cz", "C_ca"]);
    }

    #[test]
    fn tools_without_name_are_skipped_and_fields_are_kept() {
        let server = test_server("docs", "http://d");
        let tools = namespace_tools(
            &server,
            &json!({"tools": [
                {"description": "no name"},
                {"name": "find", "description": "Find docs", "inputSchema": {"type": "object"}}
            ]}),
        )
        .expect("tools array");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "docs_find");
        assert_eq!(tools[0].description, "Find docs");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));
    }

    #[test]
    fn resources_are_namespaced() {
        let server = test_server("docs", "http://d");
        let res = namespace_resources(
            &server,
            &json!({"resources": [
                {"uri": "file:///readme.md", "name": "README", "mimeType": "text/markdown"},
                {"name": "missing uri"}
            ]}),
        )
        .expect("resources array");
        assert_eq!(
            res,
            vec![ResourceDescriptor {
                uri: "docs://file:///readme.md".into(),
                name: "[docs] README".into(),
                description: None,
                mime_type: Some("text/markdown".into()),
            }]
        );
    }

    #[test]
    fn non_list_result_is_malformed() {
        let server = test_server("docs", "http://d");
        assert!(matches!(
            namespace_tools(&server, &json!({"tools": "oops"})),
            Err(TransportError::MalformedBody(_))
        ));
        assert!(matches!(
            namespace_resources(&server, &json!(null)),
            Err(TransportError::MalformedBody(_))
        ));
        assert_eq!(
            namespace_tools(&server, &json!({"tools": []})).expect("empty list").len(),
            0
        );
    }

    #[tokio::test]
    async fn backend_without_list_member_is_recorded_as_failure() {
        let transport = FnTransport::new(|server: &BackendServer, _: &str, _: Option<&Value>| {
            match server.name.as_str() {
                "B" => Ok(json!({})),
                _ => Ok(json!({"tools": [{"name": "x"}], "resources": [{"uri": "file:///r"}]})),
            }
        });
        let tools = list_tools(&registry(), &transport, Duration::from_secs(1)).await;
        let names: Vec<_> = tools.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A_x", "C_x"]);
        assert_eq!(tools.failures.len(), 1);
        assert_eq!(tools.failures[0].0, "B");
        assert!(tools.failures[0].1.contains("tools"));

        let resources = list_resources(&registry(), &transport, Duration::from_secs(1)).await;
        assert_eq!(resources.items.len(), 2);
        assert_eq!(resources.failures.len(), 1);
    }

    #[tokio::test]
    async fn listing_is_idempotent() {
        let transport = FnTransport::new(|server: &BackendServer, _: &str, _: Option<&Value>| {
            Ok(json!({"tools": [{"name": format!("t_{}", server.name)}]}))
        });
        let reg = registry();
        let first = list_tools(&reg, &transport, Duration::from_secs(1)).await;
        let second = list_tools(&reg, &transport, Duration::from_secs(1)).await;
        assert_eq!(first.items, second.items);
    }
}
