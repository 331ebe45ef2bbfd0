//! `tools/call` and `resources/read`: resolve the qualified name, then forward or schedule.

use mcp_bridge_protocol::{ResourceReadParams, ToolCallParams};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BridgeError;
use crate::executor::{JobQueue, ToolJob};
use crate::identity::Identity;
use crate::registry::{BackendServer, ExecutionMode, ServerRegistry};
use crate::store::{Store, Task, TaskStatus, TaskTransition};
use crate::transport::{BackendTransport, TransportError};

/// Immediate answer to a background `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Clone)]
pub struct InvocationRouter {
    pub registry: Arc<ServerRegistry>,
    pub transport: Arc<dyn BackendTransport>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub call_timeout: Duration,
    pub task_ttl: Duration,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, BridgeError> {
    let params = params.ok_or_else(|| BridgeError::InvalidParams("missing params".into()))?;
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))
}

/// Map a synchronous forwarding failure to what the caller sees.
fn call_failure(server: &BackendServer, err: TransportError) -> BridgeError {
    match err {
        TransportError::Rpc(e) => BridgeError::BackendRpc {
            server: server.name.clone(),
            code: e.code,
            message: e.message,
            data: e.data,
        },
        other => BridgeError::BackendUnavailable {
            server: server.name.clone(),
            reason: other.to_string(),
        },
    }
}

impl InvocationRouter {
    pub async fn call_tool(
        &self,
        identity: &Identity,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let ToolCallParams { name, arguments } = parse_params(params)?;
        let (server, tool) = self.registry.resolve_tool(&name)?;

        match server.execution_mode(tool) {
            ExecutionMode::Inline => {
                let forwarded = json!({ "name": tool, "arguments": arguments });
                self.transport
                    .call(server, "tools/call", Some(forwarded), self.call_timeout)
                    .await
                    .map_err(|e| {
                        tracing::warn!(server = %server.name, tool, error = %e, "tool call failed");
                        call_failure(server, e)
                    })
            }
            ExecutionMode::Background => {
                let accepted = self
                    .schedule(identity, server, tool, arguments)
                    .await?;
                serde_json::to_value(accepted).map_err(|e| BridgeError::Internal(e.into()))
            }
        }
    }

    async fn schedule(
        &self,
        identity: &Identity,
        server: &BackendServer,
        tool: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<TaskAccepted, BridgeError> {
        let task = Task::pending(&server.name, tool, &identity.user_id);
        let task_id = task.task_id;
        self.store.create_task(&task, self.task_ttl).await?;

        let job = ToolJob {
            task_id,
            server: server.clone(),
            tool: tool.to_string(),
            arguments,
        };
        if let Err(e) = self.queue.submit(job).await {
            tracing::error!(%task_id, error = %e, "failed to schedule task");
            let fail = TaskTransition::Fail {
                error: format!("scheduling failed: {e}"),
            };
            if let Err(store_err) = self
                .store
                .transition_task(task_id, TaskStatus::Pending, fail)
                .await
            {
                tracing::warn!(%task_id, error = %store_err, "failed to mark unscheduled task failed");
            }
            return Err(BridgeError::Internal(anyhow::anyhow!(
                "schedule task {task_id}: {e}"
            )));
        }

        tracing::info!(%task_id, server = %server.name, tool, user_id = %identity.user_id, "task scheduled");
        Ok(TaskAccepted {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
            message: format!("Task scheduled; poll /task/{task_id} for the result"),
        })
    }

    pub async fn read_resource(&self, params: Option<Value>) -> Result<Value, BridgeError> {
        let ResourceReadParams { uri } = parse_params(params)?;
        let (server, original_uri) = self.registry.resolve_resource_uri(&uri)?;

        self.transport
            .call(
                server,
                "resources/read",
                Some(json!({ "uri": original_uri })),
                self.call_timeout,
            )
            .await
            .map_err(|e| {
                tracing::warn!(server = %server.name, uri = %uri, error = %e, "resource read failed");
                match e {
                    TransportError::Status { .. } | TransportError::Rpc(_) => {
                        BridgeError::ResourceNotFound(format!("resource read failed: {uri}"))
                    }
                    other => call_failure(server, other),
                }
            })
    }
}
