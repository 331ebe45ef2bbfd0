#![allow(dead_code)]

use anyhow::Context as _;
use axum::http::header;
use axum::response::{IntoResponse as _, Response};
use axum::{Json, Router, extract::State, routing::get, routing::post};
use serde_json::{Value, json};
use std::io::BufRead as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const KEY_ALICE: &str = "key-alice";
pub const KEY_BOB: &str = "key-bob";

/// Kills the child process when dropped so a failing test never leaks a bridge.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub struct SpawnedBridge {
    pub child: KillOnDrop,
    pub base: String,
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // Logs are JSON when stdout is piped; the address ends before the next quote or brace.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

fn wait_for_bridge_port(mut child: Child, timeout: Duration) -> anyhow::Result<SpawnedBridge> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let start = Instant::now();
    let mut last_lines: Vec<String> = Vec::new();
    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!(
                "bridge process exited early: {status}; output:\n{}",
                last_lines.join("\n")
            );
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line.clone());
                if let Some(addr) = parse_listen_addr(&line, "Starting bridge HTTP server on ") {
                    return Ok(SpawnedBridge {
                        child: KillOnDrop(child),
                        base: format!("http://{addr}"),
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = child.kill();
    anyhow::bail!(
        "timed out waiting for bridge port; last output:\n{}",
        last_lines.join("\n")
    );
}

pub fn spawn_bridge(config_path: &Path) -> anyhow::Result<SpawnedBridge> {
    let bin = env!("CARGO_BIN_EXE_mcp-bridge");
    let child = Command::new(bin)
        .arg("--bind")
        .arg("127.0.0.1:0")
        .arg("--config")
        .arg(config_path)
        .arg("--log-level")
        .arg("info")
        // Always the in-memory store, whatever the developer's shell exports.
        .env_remove("MCP_BRIDGE_REDIS_URL")
        .env_remove("MCP_BRIDGE_LIST_TIMEOUT_SECS")
        .env_remove("MCP_BRIDGE_CALL_TIMEOUT_SECS")
        .env_remove("MCP_BRIDGE_HEALTH_TIMEOUT_SECS")
        .env("MCP_BRIDGE_TEST_JWT_SECRET", JWT_SECRET)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn bridge")?;
    wait_for_bridge_port(child, Duration::from_secs(10))
}

/// Write a bridge config for `servers` (name, base url) plus `extra` YAML appended verbatim.
pub fn write_config(
    dir: &tempfile::TempDir,
    servers: &[(&str, &str)],
    extra: &str,
) -> anyhow::Result<PathBuf> {
    let cfg_path = dir.path().join("bridge.yaml");
    let mut config = String::from(if servers.is_empty() {
        "servers: []\n"
    } else {
        "servers:\n"
    });
    for (name, url) in servers {
        config.push_str(&format!(
            "  - name: {name}\n    url: \"{url}\"\n    description: \"mock backend {name}\"\n"
        ));
    }
    config.push_str(&format!(
        r#"
auth:
  jwt:
    secret: "${{MCP_BRIDGE_TEST_JWT_SECRET}}"
  apiKeys:
    - {{ key: {KEY_ALICE}, userId: alice, username: alice }}
    - {{ key: {KEY_BOB}, userId: bob, username: bob }}
{extra}
"#
    ));
    std::fs::write(&cfg_path, config).context("write bridge config")?;
    Ok(cfg_path)
}

/// Behavior of one mock backend tool server.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    pub tools: Vec<&'static str>,
    pub resources: Vec<&'static str>,
    pub list_delay: Duration,
    pub call_delay: Duration,
    pub fail_calls: bool,
    /// Failed calls carry `"result": null` ahead of the `error` member.
    pub null_result_in_errors: bool,
}

pub struct RunningBackend {
    pub base: String,
    pub calls: Arc<AtomicUsize>,
    pub handle: tokio::task::JoinHandle<()>,
}

impl Drop for RunningBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct BackendState {
    behavior: MockBackend,
    calls: Arc<AtomicUsize>,
}

fn rpc_result(id: &Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}))
}

/// Hand-written body so the member order survives serialization.
fn rpc_error_with_null_result(id: &Value, code: i64, message: &str) -> Response {
    let body = format!(
        r#"{{"jsonrpc":"2.0","id":{id},"result":null,"error":{{"code":{code},"message":{}}}}}"#,
        Value::from(message)
    );
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn backend_rpc(State(state): State<Arc<BackendState>>, Json(req): Json<Value>) -> Response {
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let params = req.get("params").cloned().unwrap_or(Value::Null);
    let mock = &state.behavior;
    match req.get("method").and_then(Value::as_str).unwrap_or_default() {
        "tools/list" => {
            tokio::time::sleep(mock.list_delay).await;
            let tools: Vec<Value> = mock
                .tools
                .iter()
                .map(|t| json!({"name": t, "description": format!("mock {t}"), "inputSchema": {"type": "object"}}))
                .collect();
            rpc_result(&id, json!({ "tools": tools })).into_response()
        }
        "resources/list" => {
            tokio::time::sleep(mock.list_delay).await;
            let resources: Vec<Value> = mock
                .resources
                .iter()
                .map(|uri| json!({"uri": uri, "name": uri, "mimeType": "text/plain"}))
                .collect();
            rpc_result(&id, json!({ "resources": resources })).into_response()
        }
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            if mock.resources.iter().any(|r| *r == uri) {
                rpc_result(
                    &id,
                    json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}")}]}),
                )
                .into_response()
            } else {
                rpc_error(&id, -32602, "unknown resource").into_response()
            }
        }
        "tools/call" => {
            state.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(mock.call_delay).await;
            if mock.fail_calls {
                if mock.null_result_in_errors {
                    return rpc_error_with_null_result(&id, -32050, "tool exploded");
                }
                return rpc_error(&id, -32050, "tool exploded").into_response();
            }
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            rpc_result(
                &id,
                json!({"content": [{"type": "text", "text": format!("{name} ran with {args}")}], "isError": false}),
            )
            .into_response()
        }
        _ => rpc_error(&id, -32601, "Method not found").into_response(),
    }
}

pub async fn start_backend(behavior: MockBackend) -> anyhow::Result<RunningBackend> {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = Arc::new(BackendState {
        behavior,
        calls: calls.clone(),
    });
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/mcp", post(backend_rpc))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let base = format!("http://{addr}");
    wait_http_ok(&format!("{base}/health"), Duration::from_secs(10)).await?;
    Ok(RunningBackend {
        base,
        calls,
        handle,
    })
}

pub fn mint_jwt(sub: &str, jti: &str, exp_offset_secs: i64) -> anyhow::Result<String> {
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({"sub": sub, "jti": jti, "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .context("mint JWT")
}

pub async fn rpc(
    client: &reqwest::Client,
    base: &str,
    api_key: Option<&str>,
    body: Value,
) -> anyhow::Result<Value> {
    let mut req = client.post(format!("{base}/mcp")).json(&body);
    if let Some(key) = api_key {
        req = req.header("x-api-key", key);
    }
    let resp = req.send().await.context("POST /mcp")?;
    anyhow::ensure!(resp.status().is_success(), "unexpected status {}", resp.status());
    resp.json().await.context("decode JSON-RPC response")
}

pub async fn get_task(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    task_id: &str,
) -> anyhow::Result<reqwest::Response> {
    client
        .get(format!("{base}/task/{task_id}"))
        .header("x-api-key", api_key)
        .send()
        .await
        .context("GET /task")
}

/// Poll until the task reaches a terminal status.
pub async fn wait_task_terminal(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    task_id: &str,
    timeout: Duration,
) -> anyhow::Result<Value> {
    let start = Instant::now();
    loop {
        let resp = get_task(client, base, api_key, task_id).await?;
        anyhow::ensure!(resp.status().is_success(), "poll failed: {}", resp.status());
        let task: Value = resp.json().await?;
        if matches!(task["status"].as_str(), Some("completed" | "failed")) {
            return Ok(task);
        }
        anyhow::ensure!(start.elapsed() < timeout, "task {task_id} did not finish: {task}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
