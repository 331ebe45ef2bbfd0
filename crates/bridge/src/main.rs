use anyhow::Context as _;
use clap::Parser;
use mcp_bridge::config::{self, BridgeConfig};
use mcp_bridge::executor::{ToolCallExecutor, WorkerPool};
use mcp_bridge::identity::ChainedIdentityProvider;
use mcp_bridge::registry::ServerRegistry;
use mcp_bridge::state::{BridgeParts, BridgeState, VERSION};
use mcp_bridge::store::{MemoryStore, RedisStore, Store, memory};
use mcp_bridge::transport::HttpTransport;
use std::io::IsTerminal as _;
use std::time::Duration;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// How long in-flight background tasks get to finish after shutdown is requested.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// CLI arguments for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-bridge")]
#[command(version, about = "MCP Bridge: one JSON-RPC endpoint over many MCP tool servers")]
struct CliArgs {
    /// Path to the bridge config file (YAML).
    #[arg(short = 'c', long = "config", env = "MCP_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (ip:port).
    #[arg(
        short = 'b',
        long,
        env = "MCP_BRIDGE_BIND",
        default_value = "127.0.0.1:8002"
    )]
    bind: String,

    /// Redis URL for the shared task/session store. In-memory when unset.
    #[arg(long = "redis-url", env = "MCP_BRIDGE_REDIS_URL")]
    redis_url: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "MCP_BRIDGE_LOG",
        default_value = "info"
    )]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting MCP Bridge v{VERSION}");
    Box::pin(run(args)).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref()).await?;
    let bind = parse_socket_addr(&args.bind, "bind")?;
    let shutdown = CancellationToken::new();

    let store = build_store(args.redis_url.as_deref(), &config, &shutdown).await?;
    let registry = Arc::new(ServerRegistry::from_config(&config));
    if registry.is_empty() {
        tracing::warn!("no backend servers configured; listings will be empty");
    }
    let transport = Arc::new(HttpTransport::new(build_no_redirect_http_client(
        "backend HTTP client",
    )?));
    let identity = Arc::new(ChainedIdentityProvider::from_config(
        &config.auth,
        store.clone(),
    ));
    if config.auth.jwt.is_none() && config.auth.api_keys.is_empty() {
        tracing::warn!("no credentials configured; tools/call and task polling will always be refused");
    }

    let timeouts = mcp_bridge::timeouts::Timeouts::resolve(&config.timeouts);
    let executor = ToolCallExecutor::new(store.clone(), transport.clone(), timeouts.call);
    let pool = Arc::new(WorkerPool::start(
        executor,
        config.tasks.workers,
        config.tasks.queue_capacity,
        shutdown.clone(),
    ));

    let state = Arc::new(BridgeState::new(
        &config,
        BridgeParts {
            registry,
            transport,
            store,
            identity,
            queue: pool.clone(),
        },
    ));
    tracing::info!(
        servers = state.registry.len(),
        workers = config.tasks.workers,
        list_timeout = ?state.timeouts.list,
        call_timeout = ?state.timeouts.call,
        "bridge configured"
    );

    let app = mcp_bridge::http::router(state.clone());
    let (listener, _bound) = bind_and_log(bind).await?;
    spawn_shutdown_watcher(shutdown.clone());

    let server_ct = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            server_ct.cancelled().await;
        })
        .await
        .context("serve HTTP")?;

    // The router holds the last other reference to the pool through `state`.
    drop(state);
    match Arc::try_unwrap(pool) {
        Ok(pool) => {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, pool.join())
                .await
                .is_err()
            {
                tracing::warn!("task workers did not stop within {WORKER_DRAIN_TIMEOUT:?}");
            }
        }
        Err(_) => tracing::warn!("task worker pool still referenced at shutdown"),
    }

    tracing::info!("Bridge shut down gracefully");
    Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<BridgeConfig> {
    match path {
        Some(path) => {
            let cfg = config::load(path).await?;
            tracing::info!(path = %path.display(), servers = cfg.servers.len(), "loaded config");
            Ok(cfg)
        }
        None => {
            tracing::warn!("no config file given; starting with no backend servers");
            Ok(BridgeConfig::default())
        }
    }
}

async fn build_store(
    redis_url: Option<&str>,
    config: &BridgeConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<Arc<dyn Store>> {
    if let Some(url) = redis_url {
        let store = RedisStore::connect(url).await?;
        store.ping().await.context("ping Redis at startup")?;
        tracing::info!("using Redis store");
        return Ok(Arc::new(store));
    }

    let store = Arc::new(MemoryStore::new());
    memory::spawn_sweeper(
        store.clone(),
        Duration::from_secs(config.tasks.sweep_interval_secs),
        shutdown.clone(),
    );
    tracing::info!("using in-memory store (tasks and sessions are lost on restart)");
    Ok(store)
}

fn build_no_redirect_http_client(label: &'static str) -> anyhow::Result<reqwest::Client> {
    // Backends are configured with their final URL; redirects are not followed.
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .with_context(|| format!("build {label}"))
}

fn parse_socket_addr(value: &str, name: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid {name} address '{value}'"))
}

async fn bind_and_log(addr: SocketAddr) -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind address '{addr}'"))?;
    let bound = listener.local_addr().context("get bind address")?;
    tracing::info!("Starting bridge HTTP server on {bound}");
    Ok((listener, bound))
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if std::io::stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
