use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;

use crate::registry::{BackendServer, ServerRegistry};
use crate::transport::{BackendTransport, HealthProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server: String,
    pub name: String,
    pub url: String,
    pub description: String,
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub servers: Vec<ServerStatus>,
}

fn server_status(server: &BackendServer, probe: HealthProbe, at: DateTime<Utc>) -> ServerStatus {
    let (status, status_code, last_ping, error) = match probe {
        HealthProbe::Healthy => (HealthState::Healthy, Some(200), Some(at), None),
        HealthProbe::Unhealthy { status } => (HealthState::Unhealthy, Some(status), Some(at), None),
        HealthProbe::Unreachable { reason } => (HealthState::Unreachable, None, None, Some(reason)),
    };
    ServerStatus {
        server: server.name.clone(),
        name: server.display_name.clone(),
        url: server.base_url.clone(),
        description: server.description.clone(),
        status,
        status_code,
        last_ping,
        error,
    }
}

/// Probe every backend at once. One entry per registered server, in registry order.
pub async fn probe_all(
    registry: &ServerRegistry,
    transport: &dyn BackendTransport,
    timeout: Duration,
) -> Vec<ServerStatus> {
    let probes = registry.iter().map(|server| async move {
        let probe = transport.probe_health(server, timeout).await;
        if let HealthProbe::Unreachable { reason } = &probe {
            tracing::warn!(server = %server.name, %reason, "backend health probe failed");
        }
        server_status(server, probe, Utc::now())
    });
    join_all(probes).await
}
