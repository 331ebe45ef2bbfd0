use axum::http::StatusCode;
use mcp_bridge_protocol::{ErrorCode, ErrorObject};
use serde_json::{Value, json};

/// Every failure a JSON-RPC handler can report.
///
/// Each variant maps to exactly one JSON-RPC code (and one HTTP status for the REST endpoints).
/// `Internal` carries the full cause for logging but is shown to callers as `"Internal error"`.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Parse error")]
    Parse,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Access denied")]
    AuthorizationFailed,
    #[error("Server '{server}' unavailable: {reason}")]
    BackendUnavailable { server: String, reason: String },
    #[error("{message}")]
    BackendRpc {
        server: String,
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },
    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse => ErrorCode::PARSE_ERROR,
            Self::InvalidRequest(_) => ErrorCode::INVALID_REQUEST,
            Self::MethodNotFound(_) => ErrorCode::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => ErrorCode::INVALID_PARAMS,
            Self::ToolNotFound(_) => ErrorCode::TOOL_NOT_FOUND,
            Self::ResourceNotFound(_) => ErrorCode::RESOURCE_NOT_FOUND,
            Self::AuthenticationFailed(_) => ErrorCode::AUTHENTICATION_FAILED,
            Self::AuthorizationFailed => ErrorCode::AUTHORIZATION_FAILED,
            Self::BackendUnavailable { .. } => ErrorCode::SERVER_UNAVAILABLE,
            Self::BackendRpc { code, .. } => *code,
            Self::Internal(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Parse
            | Self::InvalidRequest(_)
            | Self::InvalidParams(_)
            | Self::BackendRpc { .. } => StatusCode::BAD_REQUEST,
            Self::MethodNotFound(_) | Self::ToolNotFound(_) | Self::ResourceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::AuthorizationFailed => StatusCode::FORBIDDEN,
            Self::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing error object. Never includes internal causes.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        let obj = ErrorObject::new(self.code(), self.to_string());
        match self {
            Self::BackendUnavailable { server, .. } => obj.with_data(json!({ "server": server })),
            Self::BackendRpc { server, data, .. } => {
                let mut d = json!({ "server": server });
                if let Some(data) = data {
                    d["backendData"] = data.clone();
                }
                obj.with_data(d)
            }
            _ => obj,
        }
    }
}

/// Render an `anyhow` chain on one line for logs.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    err.chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
