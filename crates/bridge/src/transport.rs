use async_trait::async_trait;
use mcp_bridge_protocol::{ErrorObject, JsonRpcRequest, JsonRpcResponse, ResponsePayload};
use serde_json::Value;
use std::time::Duration;

use crate::registry::BackendServer;

/// Why a single backend call did not produce a `result`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("backend returned HTTP {status}")]
    Status { status: u16 },
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed backend response: {0}")]
    MalformedBody(String),
    #[error("backend error {}: {}", .0.code.0, .0.message)]
    Rpc(ErrorObject),
}

/// Outcome of a `GET /health` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    Healthy,
    Unhealthy { status: u16 },
    Unreachable { reason: String },
}

/// JSON-RPC client for backend tool servers.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Send one freshly-id'd request and return the backend's `result`.
    async fn call(
        &self,
        server: &BackendServer,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    async fn probe_health(&self, server: &BackendServer, timeout: Duration) -> HealthProbe;
}

/// `reqwest`-backed transport: `POST {base_url}{rpc_path}` and `GET {base_url}/health`.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post_envelope(
        &self,
        url: &str,
        request: &JsonRpcRequest,
    ) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        decode_response(&body)
    }
}

/// Decode a backend response body into its `result`, surfacing error envelopes.
pub fn decode_response(body: &[u8]) -> Result<Value, TransportError> {
    let envelope: JsonRpcResponse =
        serde_json::from_slice(body).map_err(|e| TransportError::MalformedBody(e.to_string()))?;
    match envelope.payload {
        ResponsePayload::Result(v) => Ok(v),
        ResponsePayload::Error(e) => Err(TransportError::Rpc(e)),
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn call(
        &self,
        server: &BackendServer,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let request = JsonRpcRequest::new(uuid::Uuid::new_v4().to_string(), method, params);
        let url = server.rpc_url();
        tracing::debug!(server = %server.name, method, id = %request.id, "forwarding to backend");

        match tokio::time::timeout(timeout, self.post_envelope(&url, &request)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn probe_health(&self, server: &BackendServer, timeout: Duration) -> HealthProbe {
        let fut = self.http.get(server.health_url()).send();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(resp)) if resp.status().is_success() => HealthProbe::Healthy,
            Ok(Ok(resp)) => HealthProbe::Unhealthy {
                status: resp.status().as_u16(),
            },
            Ok(Err(e)) => HealthProbe::Unreachable {
                reason: e.to_string(),
            },
            Err(_) => HealthProbe::Unreachable {
                reason: format!("no answer within {timeout:?}"),
            },
        }
    }
}
