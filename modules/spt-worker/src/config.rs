use std::time::Duration;

use anyhow::{Context, Result};
use spt_common::config::{env_or, load_dotenv};
use spt_common::DatabaseConfig;
use spt_expressions::ExpressionSource;

use crate::worker::{DEFAULT_CELL_NUMBER_LIMIT, DEFAULT_JOB_TIMEOUT, MAX_IDLE_WAIT};

/// One LISTEN connection plus one query connection.
pub const WORKER_CONNECTIONS: u32 = 2;

/// Worker configuration, loaded from the environment.
///
/// `DATABASE_MAX_CONNECTIONS` is ignored; the pool is always
/// [`WORKER_CONNECTIONS`] wide.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub expressions: ExpressionSource,
    pub job_timeout: Duration,
    pub cell_number_limit: usize,
    pub idle_wait: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();

        let idle_wait: u64 = env_or("WORKER_IDLE_WAIT_SECONDS", MAX_IDLE_WAIT.as_secs())?;
        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .context("DATABASE_URL environment variable is required")?,
                max_connections: WORKER_CONNECTIONS,
            },
            expressions: ExpressionSource::from_env(),
            job_timeout: Duration::from_secs(env_or(
                "JOB_COMPUTATION_TIMEOUT_SECONDS",
                DEFAULT_JOB_TIMEOUT.as_secs(),
            )?),
            cell_number_limit: env_or("CELL_NUMBER_LIMIT_PROXIMITY", DEFAULT_CELL_NUMBER_LIMIT)?,
            idle_wait: Duration::from_secs(idle_wait).min(MAX_IDLE_WAIT),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", self.database.redacted_url());
        tracing::info!("  JOB_COMPUTATION_TIMEOUT_SECONDS: {}", self.job_timeout.as_secs());
        tracing::info!("  CELL_NUMBER_LIMIT_PROXIMITY: {}", self.cell_number_limit);
        tracing::info!("  WORKER_IDLE_WAIT_SECONDS: {}", self.idle_wait.as_secs());
        match &self.expressions {
            ExpressionSource::Directory(dir) => {
                tracing::info!("  EXPRESSIONS_DIRECTORY: {}", dir.display())
            }
            ExpressionSource::Database => tracing::info!("  EXPRESSIONS_DIRECTORY: <not set>"),
        }
    }
}
