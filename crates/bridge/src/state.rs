use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BridgeConfig;
use crate::executor::JobQueue;
use crate::identity::IdentityProvider;
use crate::invoke::InvocationRouter;
use crate::registry::ServerRegistry;
use crate::store::Store;
use crate::timeouts::Timeouts;
use crate::transport::BackendTransport;

pub const SERVICE_NAME: &str = "MCP Bridge";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler needs. Built once at startup and shared behind an `Arc`.
pub struct BridgeState {
    pub registry: Arc<ServerRegistry>,
    pub transport: Arc<dyn BackendTransport>,
    pub store: Arc<dyn Store>,
    pub identity: Arc<dyn IdentityProvider>,
    pub router: InvocationRouter,
    pub timeouts: Timeouts,
    pub protocol_version: String,
    pub session_ttl: Duration,
    pub started_at: Instant,
}

pub struct BridgeParts {
    pub registry: Arc<ServerRegistry>,
    pub transport: Arc<dyn BackendTransport>,
    pub store: Arc<dyn Store>,
    pub identity: Arc<dyn IdentityProvider>,
    pub queue: Arc<dyn JobQueue>,
}

impl BridgeState {
    #[must_use]
    pub fn new(config: &BridgeConfig, parts: BridgeParts) -> Self {
        let timeouts = Timeouts::resolve(&config.timeouts);
        let router = InvocationRouter {
            registry: parts.registry.clone(),
            transport: parts.transport.clone(),
            store: parts.store.clone(),
            queue: parts.queue,
            call_timeout: timeouts.call,
            task_ttl: Duration::from_secs(config.tasks.ttl_secs),
        };
        Self {
            registry: parts.registry,
            transport: parts.transport,
            store: parts.store,
            identity: parts.identity,
            router,
            timeouts,
            protocol_version: config.protocol_version.clone(),
            session_ttl: Duration::from_secs(config.sessions.ttl_secs),
            started_at: Instant::now(),
        }
    }
}
