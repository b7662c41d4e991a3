use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use spt_common::telemetry::init_tracing;
use spt_common::QueueActivity;
use spt_queue::{ActivitySink, PgNotifier};
use spt_watcher::{Watcher, WatcherConfig, WatcherDeps};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spt-watcher", about = "Tracks metric workers and their jobs")]
struct Cli {
    /// Seconds between periodic sweeps, overriding the environment
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Run one sweep and exit
    #[arg(long)]
    once: bool,

    /// Ask a running watcher to sweep now, then exit
    #[arg(long, conflicts_with = "once")]
    request_sweep: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("Starting spt-watcher");

    let mut config = WatcherConfig::from_env()?;
    if let Some(seconds) = cli.sweep_interval {
        config.sweep_interval = Duration::from_secs(seconds.max(1));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;

    if cli.request_sweep {
        PgNotifier::new(pool)
            .publish(&QueueActivity::CheckForFailedJobs("spt-watcher --request-sweep".into()))
            .await;
        return Ok(());
    }

    let mut watcher = Watcher::new(
        WatcherDeps::builder()
            .pool(pool)
            .sweep_interval(config.sweep_interval)
            .build(),
    );

    if cli.once {
        let report = watcher.sweep().await?;
        info!(
            dead_workers = ?report.dead_workers,
            orphaned = report.orphaned.len(),
            abandoned = report.abandoned.len(),
            "Single sweep finished"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c; stop the process to shut down");
            std::future::pending::<()>().await;
        }
        info!("Received ctrl-c");
        let _ = shutdown_tx.send(true);
    });

    let stats = watcher.run(shutdown_rx).await?;
    info!("spt-watcher stopped. {stats}");
    Ok(())
}
