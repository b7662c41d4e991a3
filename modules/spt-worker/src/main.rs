use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use spt_common::telemetry::init_tracing;
use spt_expressions::StudyRegistry;
use spt_worker::{Worker, WorkerConfig, WorkerDeps};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spt-worker", about = "Computes queued on-demand metrics")]
struct Cli {
    /// Process jobs until the queue is empty, then exit
    #[arg(long)]
    drain: bool,

    /// Per-job computation timeout in seconds, overriding the environment
    #[arg(long)]
    job_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("Starting spt-worker");

    let mut config = WorkerConfig::from_env()?;
    if let Some(seconds) = cli.job_timeout {
        config.job_timeout = Duration::from_secs(seconds);
    }

    // Connections are never recycled so the backend pid stays stable for the
    // watcher.
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;

    let registry = StudyRegistry::load(&pool, &config.expressions)
        .await
        .context("Failed to load expression data")?;
    if registry.is_empty() {
        warn!("No studies registered in study_lookup; nothing to compute");
    }

    let mut worker = Worker::new(
        WorkerDeps::builder()
            .pool(pool)
            .registry(Arc::new(registry))
            .job_timeout(config.job_timeout)
            .cell_number_limit(config.cell_number_limit)
            .idle_wait(config.idle_wait)
            .build(),
    );

    if cli.drain {
        worker.drain().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c; stop the process to shut down");
            std::future::pending::<()>().await;
        }
        info!("Received ctrl-c; finishing the current job");
        let _ = shutdown_tx.send(true);
    });

    let stats = worker.run(shutdown_rx).await?;
    info!("spt-worker stopped. {stats}");
    Ok(())
}
