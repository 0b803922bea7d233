//! # Client Configuration
//!
//! Environment-driven configuration with defaults suitable for local
//! development. Scheduler tuning knobs live here so deployments can adjust
//! the rate limit and backoff without a rebuild.

use std::env;
use std::time::Duration;

/// Top-level client configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Backend API base URL.
    pub api_base_url: String,
    /// Relay endpoint for the universal (pairing-based) provider.
    pub relay_url: String,
    /// Project identifier sent during the relay handshake.
    pub relay_project_id: String,
    /// Local JSON-RPC endpoint of a host-injected wallet bridge, if any.
    /// `None` means no injected wallet is available on this host.
    pub injected_rpc_url: Option<String>,
    /// Relay handshake deadline.
    pub handshake_timeout: Duration,
    /// Minimum spacing between dispatched backend calls.
    pub scheduler_min_interval: Duration,
    /// Validity window of cached backend responses.
    pub scheduler_cache_ttl: Duration,
    /// Wait applied after a rate-limited response before falling back to cache.
    pub scheduler_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let api_base_url = env::var("API_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3001".to_string());

        let relay_url = env::var("RELAY_URL")
            .unwrap_or_else(|_| "wss://relay.vaultline.io/ws".to_string());

        let relay_project_id = env::var("RELAY_PROJECT_ID").unwrap_or_default();

        let injected_rpc_url = env::var("INJECTED_WALLET_RPC_URL").ok();

        let handshake_timeout = parse_secs("HANDSHAKE_TIMEOUT_SECS", 120)?;
        let scheduler_min_interval = parse_millis("SCHEDULER_MIN_INTERVAL_MS", 500)?;
        let scheduler_cache_ttl = parse_secs("SCHEDULER_CACHE_TTL_SECS", 30)?;
        let scheduler_backoff = parse_millis("SCHEDULER_BACKOFF_MS", 2000)?;

        Ok(Self {
            api_base_url,
            relay_url,
            relay_project_id,
            injected_rpc_url,
            handshake_timeout,
            scheduler_min_interval,
            scheduler_cache_ttl,
            scheduler_backoff,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err("RELAY_URL must be a ws:// or wss:// URL".to_string());
        }

        if self.handshake_timeout < Duration::from_secs(5) {
            return Err("HANDSHAKE_TIMEOUT_SECS must be at least 5".to_string());
        }

        Ok(())
    }
}

fn parse_secs(var: &str, default: u64) -> Result<Duration, String> {
    let secs = env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("{} must be a valid number of seconds", var))?;
    Ok(Duration::from_secs(secs))
}

fn parse_millis(var: &str, default: u64) -> Result<Duration, String> {
    let millis = env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("{} must be a valid number of milliseconds", var))?;
    Ok(Duration::from_millis(millis))
}
