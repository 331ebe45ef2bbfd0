//! JSON-RPC envelope parsing and method routing.
//!
//! Nothing a handler does escapes this module as anything other than an envelope: errors are
//! mapped to their code, panics become `InternalError`, and the request id is echoed in both
//! cases.

use axum::http::HeaderMap;
use chrono::Utc;
use futures::FutureExt as _;
use mcp_bridge_protocol::{
    InitializeResult, JSONRPC_VERSION, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    RequestId, ServerInfo,
};
use serde_json::{Map, Value, json};
use std::panic::AssertUnwindSafe;
use tracing::Instrument as _;

use crate::aggregate;
use crate::error::{BridgeError, format_error_chain};
use crate::identity::{Credential, require_identity};
use crate::state::{BridgeState, SERVICE_NAME, VERSION};
use crate::store::Session;

/// What the HTTP layer should send back.
#[derive(Debug)]
pub enum DispatchOutcome {
    Reply {
        response: JsonRpcResponse,
        /// Set when `initialize` opened a session.
        session_id: Option<String>,
    },
    /// The message was a notification: no body.
    Accepted,
}

impl DispatchOutcome {
    fn reply(response: JsonRpcResponse) -> Self {
        Self::Reply {
            response,
            session_id: None,
        }
    }
}

/// A validated inbound message.
#[derive(Debug)]
struct Inbound {
    /// `None` for notifications.
    id: Option<RequestId>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Default)]
struct HandlerOutput {
    result: Value,
    session_id: Option<String>,
}

impl From<Value> for HandlerOutput {
    fn from(result: Value) -> Self {
        Self {
            result,
            session_id: None,
        }
    }
}

fn error_reply(id: RequestId, err: &BridgeError) -> DispatchOutcome {
    DispatchOutcome::reply(JsonRpcResponse::error(id, err.to_error_object()))
}

/// Validate the envelope shape. On failure returns the id to echo (null when unusable).
fn parse_envelope(body: &[u8]) -> Result<Inbound, (RequestId, BridgeError)> {
    let value: Value =
        serde_json::from_slice(body).map_err(|_| (RequestId::Null, BridgeError::Parse))?;
    let Value::Object(mut obj) = value else {
        return Err((
            RequestId::Null,
            BridgeError::InvalidRequest("expected a JSON object".into()),
        ));
    };

    let id = match obj.get("id") {
        None => None,
        Some(raw) => Some(RequestId::from_value(raw).ok_or_else(|| {
            (
                RequestId::Null,
                BridgeError::InvalidRequest("id must be a string, an integer or null".into()),
            )
        })?),
    };
    let echo = id.clone().unwrap_or(RequestId::Null);

    if let Some(version) = obj.get("jsonrpc")
        && version.as_str() != Some(JSONRPC_VERSION)
    {
        return Err((
            echo,
            BridgeError::InvalidRequest(format!("jsonrpc must be \"{JSONRPC_VERSION}\"")),
        ));
    }

    let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_string) else {
        return Err((echo, BridgeError::InvalidRequest("missing method".into())));
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => None,
        Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
        Some(_) => {
            return Err((
                echo,
                BridgeError::InvalidRequest("params must be an object or an array".into()),
            ));
        }
    };

    Ok(Inbound { id, method, params })
}

/// Handle one raw request body.
pub async fn dispatch(state: &BridgeState, headers: &HeaderMap, body: &[u8]) -> DispatchOutcome {
    let inbound = match parse_envelope(body) {
        Ok(inbound) => inbound,
        Err((id, err)) => {
            tracing::debug!(error = %err, "rejected malformed envelope");
            return error_reply(id, &err);
        }
    };

    let echo = inbound.id.clone().unwrap_or(RequestId::Null);
    let span = tracing::info_span!("bridge.rpc", method = %inbound.method, id = %echo);
    let is_notification = inbound.id.is_none();
    let method = inbound.method;

    let outcome = AssertUnwindSafe(route(state, headers, &method, inbound.params))
        .catch_unwind()
        .instrument(span.clone())
        .await
        .unwrap_or_else(|_| {
            Err(BridgeError::Internal(anyhow::anyhow!(
                "handler panicked while serving {method}"
            )))
        });

    span.in_scope(|| match &outcome {
        Err(BridgeError::Internal(cause)) => {
            tracing::error!(error = %format_error_chain(cause), "internal error when handling {method}");
        }
        Err(e) if is_notification => tracing::debug!(error = %e, "notification failed"),
        _ => {}
    });

    if is_notification {
        return DispatchOutcome::Accepted;
    }

    match outcome {
        Ok(out) => DispatchOutcome::Reply {
            response: JsonRpcResponse::success(echo, out.result),
            session_id: out.session_id,
        },
        Err(e) => error_reply(echo, &e),
    }
}

async fn route(
    state: &BridgeState,
    headers: &HeaderMap,
    method: &str,
    params: Option<Value>,
) -> Result<HandlerOutput, BridgeError> {
    match method {
        "initialize" => initialize(state, headers, params.as_ref()).await,
        "notifications/initialized" | "ping" => Ok(Value::Object(Map::new()).into()),
        "tools/list" => {
            let out = aggregate::list_tools(
                &state.registry,
                state.transport.as_ref(),
                state.timeouts.list,
            )
            .await;
            to_output(&ListToolsResult { tools: out.items })
        }
        "resources/list" => {
            let out = aggregate::list_resources(
                &state.registry,
                state.transport.as_ref(),
                state.timeouts.list,
            )
            .await;
            to_output(&ListResourcesResult {
                resources: out.items,
            })
        }
        "tools/call" => {
            let identity = require_identity(state.identity.as_ref(), headers).await?;
            Ok(state.router.call_tool(&identity, params).await?.into())
        }
        "resources/read" => Ok(state.router.read_resource(params).await?.into()),
        other => Err(BridgeError::MethodNotFound(other.to_string())),
    }
}

fn to_output<T: serde::Serialize>(value: &T) -> Result<HandlerOutput, BridgeError> {
    serde_json::to_value(value)
        .map(HandlerOutput::from)
        .map_err(|e| BridgeError::Internal(e.into()))
}

async fn initialize(
    state: &BridgeState,
    headers: &HeaderMap,
    params: Option<&Value>,
) -> Result<HandlerOutput, BridgeError> {
    let requested = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str);
    if let Some(requested) = requested
        && requested != state.protocol_version
    {
        tracing::warn!(
            requested,
            supported = %state.protocol_version,
            "client requested a different protocol version"
        );
    }

    let result = InitializeResult {
        protocol_version: state.protocol_version.clone(),
        capabilities: json!({
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false }
        }),
        server_info: ServerInfo {
            name: SERVICE_NAME.to_string(),
            version: VERSION.to_string(),
        },
    };
    let mut out = to_output(&result)?;
    out.session_id = open_session(state, headers).await;
    Ok(out)
}

/// Best-effort: any failure is logged and `initialize` proceeds without a session.
async fn open_session(state: &BridgeState, headers: &HeaderMap) -> Option<String> {
    let credential = Credential::from_headers(headers)?;
    let identity = match state.identity.resolve(&credential).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!(error = %e, "initialize without a usable credential, no session");
            return None;
        }
    };

    let now = Utc::now();
    let session = Session {
        session_id: uuid::Uuid::new_v4().to_string(),
        user_id: identity.user_id,
        username: identity.username,
        email: identity.email,
        created_at: now,
        last_accessed: now,
    };
    match state.store.create_session(&session, state.session_ttl).await {
        Ok(()) => {
            tracing::info!(session_id = %session.session_id, user_id = %session.user_id, "session opened");
            Some(session.session_id)
        }
        Err(e) => {
            tracing::warn!(error = %format_error_chain(&e), "failed to persist session");
            None
        }
    }
}
