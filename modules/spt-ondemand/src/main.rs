use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use spt_common::telemetry::init_tracing;
use spt_common::StudySchema;
use spt_expressions::StudyRegistry;
use spt_ondemand::{OndemandConfig, OndemandService, ServiceDeps};
use spt_queue::{ensure_schema, register_study};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spt-ondemand", about = "On-demand metrics TCP service")]
struct Cli {
    /// Service name selecting `<SERVICE>_HOST` / `<SERVICE>_PORT` overrides
    #[arg(long, env = "ONDEMAND_SERVICE_NAME")]
    service: Option<String>,

    /// Bind host, overriding the environment
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overriding the environment
    #[arg(long)]
    port: Option<u16>,

    /// Create the study tables and register the study before serving
    #[arg(long, value_name = "STUDY=SCHEMA")]
    bootstrap: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("Starting spt-ondemand");

    let mut config = OndemandConfig::from_env(cli.service.as_deref())?;
    if let Some(host) = cli.host {
        config.address.host = host;
    }
    if let Some(port) = cli.port {
        config.address.port = port;
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;

    for pair in &cli.bootstrap {
        let (study, schema) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--bootstrap expects STUDY=SCHEMA, got {pair:?}"))?;
        let schema = StudySchema::new(schema)?;
        ensure_schema(&pool, &schema).await?;
        register_study(&pool, study, &schema).await?;
        info!(study, schema = %schema, "Bootstrapped study tables");
    }

    let registry = StudyRegistry::load(&pool, &config.expressions)
        .await
        .context("Failed to load expression data")?;
    if registry.is_empty() {
        warn!("No studies registered in study_lookup");
    }

    let service = OndemandService::new(
        ServiceDeps::builder()
            .pool(pool)
            .registry(Arc::new(registry))
            .max_request_bytes(config.max_request_bytes)
            .build(),
    );

    let addr = config.address.socket_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c; stop the process to shut down");
            std::future::pending::<()>().await;
        }
        info!("Received ctrl-c");
        let _ = shutdown_tx.send(true);
    });

    service.serve(listener, shutdown_rx).await?;
    info!("spt-ondemand stopped");
    Ok(())
}
