//! fleet plan applier
//!
//! Serializes scheduler plans through a single queue and commits the parts
//! that still fit the cluster.

use std::sync::Arc;

use anyhow::Result;
use fleet_plan_applier::{
    config::{Config, LogFormat},
    EvalTokens, PlanApplier, PlanQueue, StateStore,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    let (json, pretty) = match config.log_format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(fmt::layer().pretty())),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(json)
        .with(pretty)
        .init();

    info!(
        region = %config.region,
        max_query_time_secs = config.blocking.max_query_time.as_secs(),
        "Starting fleet plan applier"
    );

    let store = Arc::new(StateStore::new());
    let evals = Arc::new(EvalTokens::new());
    let (queue, requests) = PlanQueue::new(config.applier.queue_depth);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let applier = PlanApplier::new(
        store,
        requests,
        evals,
        config.applier.clone(),
        config.bad_nodes.clone(),
    );
    let applier_handle = tokio::spawn(applier.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    drop(queue);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, applier_handle).await {
        warn!(error = %e, "Plan applier did not shut down in time");
    }

    info!("Plan applier shutdown complete");
    Ok(())
}
