use anyhow::Result;
use spt_common::config::{env_or, load_dotenv};
use spt_common::{DatabaseConfig, ServiceAddress};
use spt_expressions::ExpressionSource;

use crate::service::DEFAULT_MAX_REQUEST_BYTES;

/// Metrics service configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct OndemandConfig {
    pub database: DatabaseConfig,
    pub address: ServiceAddress,
    pub max_request_bytes: usize,
    pub expressions: ExpressionSource,
}

impl OndemandConfig {
    pub fn from_env(service: Option<&str>) -> Result<Self> {
        load_dotenv();

        let config = Self {
            database: DatabaseConfig::from_env(10)?,
            address: ServiceAddress::from_env(service)?,
            max_request_bytes: env_or("ONDEMAND_MAX_REQUEST_BYTES", DEFAULT_MAX_REQUEST_BYTES)?,
            expressions: ExpressionSource::from_env(),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", self.database.redacted_url());
        tracing::info!("  DATABASE_MAX_CONNECTIONS: {}", self.database.max_connections);
        tracing::info!("  ONDEMAND address: {}", self.address.socket_addr());
        tracing::info!("  ONDEMAND_MAX_REQUEST_BYTES: {}", self.max_request_bytes);
        match &self.expressions {
            ExpressionSource::Directory(dir) => {
                tracing::info!("  EXPRESSIONS_DIRECTORY: {}", dir.display())
            }
            ExpressionSource::Database => tracing::info!("  EXPRESSIONS_DIRECTORY: <not set>"),
        }
    }
}
