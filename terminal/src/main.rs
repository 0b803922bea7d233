//! Vaultline terminal entry point.
//!
//! Wires configuration, storage, the request scheduler and the session
//! manager together, restores a previous wallet session when one is
//! resumable, and then services provider events until interrupted.

use std::sync::Arc;

use tracing::{error, info};

use terminal::core::Config;
use terminal::provider::ConfigProviderFactory;
use terminal::scheduler::{RequestScheduler, SchedulerConfig};
use terminal::services::api::ApiClient;
use terminal::services::storage::{ClientStorage, JsonFileStorage};
use terminal::session::SessionManager;

const STORAGE_FILE: &str = "vaultline-client.json";

#[tokio::main]
async fn main() {
    terminal::logging::init();

    let config = match Config::from_env().and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn ClientStorage> = Arc::new(JsonFileStorage::open(STORAGE_FILE));

    let scheduler = Arc::new(RequestScheduler::new(SchedulerConfig {
        min_interval: config.scheduler_min_interval,
        cache_ttl: config.scheduler_cache_ttl,
        rate_limit_backoff: config.scheduler_backoff,
    }));
    let api = Arc::new(ApiClient::new(config.api_base_url.clone()));
    let factory = Arc::new(ConfigProviderFactory::new(config, Arc::clone(&storage)));

    let manager = SessionManager::new(scheduler, api, factory, storage);

    match manager.auto_connect().await {
        Ok(true) => {
            let session = manager.session();
            info!(
                account = ?session.account,
                network = ?session.network_name,
                "session restored"
            );
        }
        Ok(false) => info!("no resumable session; waiting for explicit connect"),
        Err(e) => error!(error = %e, "auto-connect failed"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutting down");
}
