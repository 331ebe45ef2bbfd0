use std::time::Duration;

use crate::config::TimeoutConfig;

/// Default bound for `tools/list` / `resources/list` fan-out calls (seconds).
pub const DEFAULT_LIST_TIMEOUT_SECS: u64 = 30;
/// Default bound for `tools/call` / `resources/read` forwarding (seconds).
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
/// Default bound for `GET /health` probes (seconds).
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 10;

const LIST_TIMEOUT_ENV: &str = "MCP_BRIDGE_LIST_TIMEOUT_SECS";
const CALL_TIMEOUT_ENV: &str = "MCP_BRIDGE_CALL_TIMEOUT_SECS";
const HEALTH_TIMEOUT_ENV: &str = "MCP_BRIDGE_HEALTH_TIMEOUT_SECS";

/// Tiered backend timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub list: Duration,
    pub call: Duration,
    pub health: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(DEFAULT_LIST_TIMEOUT_SECS),
            call: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            health: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
        }
    }
}

fn positive_u64_env(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

impl Timeouts {
    /// Resolve effective timeouts.
    ///
    /// Precedence: env var, then config file, then built-in default. Zero values are ignored.
    #[must_use]
    pub fn resolve(cfg: &TimeoutConfig) -> Self {
        let pick = |env: &str, from_cfg: Option<u64>, default: u64| {
            let secs = positive_u64_env(env)
                .or(from_cfg.filter(|v| *v > 0))
                .unwrap_or(default);
            Duration::from_secs(secs)
        };
        Self {
            list: pick(LIST_TIMEOUT_ENV, cfg.list_secs, DEFAULT_LIST_TIMEOUT_SECS),
            call: pick(CALL_TIMEOUT_ENV, cfg.call_secs, DEFAULT_CALL_TIMEOUT_SECS),
            health: pick(HEALTH_TIMEOUT_ENV, cfg.health_secs, DEFAULT_HEALTH_TIMEOUT_SECS),
        }
    }
}
