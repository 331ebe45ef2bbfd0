//! HTTP surface: the JSON-RPC entry point plus the REST endpoints around it.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::dispatch::{DispatchOutcome, dispatch};
use crate::error::{BridgeError, format_error_chain};
use crate::identity::require_identity;
use crate::state::{BridgeState, SERVICE_NAME, VERSION};
use crate::status::{StatusResponse, probe_all};
use crate::store::RevokedCredential;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";

/// Upper bound on an inbound JSON-RPC body.
const MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;

pub fn router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/", post(post_rpc))
        .route("/mcp", post(post_rpc))
        .route("/task/{task_id}", get(get_task))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/auth/me", get(auth_me))
        .route("/auth/logout", post(auth_logout))
        .layer(DefaultBodyLimit::max(MAX_POST_BODY_BYTES))
        .with_state(state)
}

/// A `BridgeError` rendered for the REST endpoints: its HTTP status plus `{"error": {...}}`.
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let BridgeError::Internal(cause) = &self.0 {
            tracing::error!(error = %format_error_chain(cause), "internal error on REST endpoint");
        }
        let body = json!({ "error": self.0.to_error_object() });
        (self.0.http_status(), Json(body)).into_response()
    }
}

async fn post_rpc(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&state, &headers, &body).await {
        DispatchOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
        DispatchOutcome::Reply {
            response,
            session_id,
        } => {
            let mut resp = Json(response).into_response();
            if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
                resp.headers_mut().insert(HEADER_SESSION_ID, value);
            }
            resp
        }
    }
}

async fn get_task(
    State(state): State<Arc<BridgeState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let not_found = || ApiError(BridgeError::ResourceNotFound(format!("task {task_id}")));

    let Ok(id) = Uuid::parse_str(&task_id) else {
        return Err(not_found());
    };
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(BridgeError::Internal)?
        .ok_or_else(not_found)?;

    if task.user_id != identity.user_id {
        tracing::warn!(%task_id, user_id = %identity.user_id, "task poll by non-owner refused");
        return Err(BridgeError::AuthorizationFailed.into());
    }
    Ok(Json(task).into_response())
}

async fn status(State(state): State<Arc<BridgeState>>) -> Json<StatusResponse> {
    let servers = probe_all(
        &state.registry,
        state.transport.as_ref(),
        state.timeouts.health,
    )
    .await;
    Json(StatusResponse {
        service: SERVICE_NAME,
        version: VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        servers,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
}

async fn health(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                store: "ok",
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %format_error_chain(&e), "store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store: "unavailable",
                }),
            )
        }
    }
}

async fn auth_me(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    Ok(Json(identity).into_response())
}

/// Revoke the presented JWT until it would have expired anyway, and drop the MCP session if one
/// is named.
async fn auth_logout(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = require_identity(state.identity.as_ref(), &headers).await?;
    let Some(credential_id) = identity.credential_id else {
        return Err(BridgeError::InvalidRequest("API keys cannot be revoked by logout".into()).into());
    };

    let marker = RevokedCredential {
        credential_id,
        revoked_until: identity.expires_at.unwrap_or_else(Utc::now),
    };
    state
        .store
        .revoke_credential(&marker)
        .await
        .map_err(BridgeError::Internal)?;

    if let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        && let Err(e) = state.store.delete_session(session_id).await
    {
        tracing::warn!(error = %format_error_chain(&e), "failed to delete session on logout");
    }

    tracing::info!(user_id = %identity.user_id, "credential revoked");
    Ok(Json(json!({ "status": "logged_out" })).into_response())
}
