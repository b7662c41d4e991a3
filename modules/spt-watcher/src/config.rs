use std::time::Duration;

use anyhow::Result;
use spt_common::config::{env_or, load_dotenv};
use spt_common::DatabaseConfig;

use crate::watcher::DEFAULT_SWEEP_INTERVAL;

/// One LISTEN connection plus one query connection.
pub const WATCHER_CONNECTIONS: u32 = 2;

/// Watcher configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub database: DatabaseConfig,
    pub sweep_interval: Duration,
}

impl WatcherConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();

        let mut database = DatabaseConfig::from_env(WATCHER_CONNECTIONS)?;
        database.max_connections = database.max_connections.max(WATCHER_CONNECTIONS);

        let sweep_seconds: u64 =
            env_or("WATCHER_SWEEP_INTERVAL_SECONDS", DEFAULT_SWEEP_INTERVAL.as_secs())?;
        let config = Self {
            database,
            sweep_interval: Duration::from_secs(sweep_seconds.max(1)),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", self.database.redacted_url());
        tracing::info!("  DATABASE_MAX_CONNECTIONS: {}", self.database.max_connections);
        tracing::info!(
            "  WATCHER_SWEEP_INTERVAL_SECONDS: {}",
            self.sweep_interval.as_secs()
        );
    }
}
