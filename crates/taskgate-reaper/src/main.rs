use std::sync::Arc;

use anyhow::{Context, Result};
use taskgate::persistence::PostgresDispatchStore;
use taskgate::telemetry::{init_tracing, TelemetryConfig};
use taskgate::{DispatchConfig, WorkQueue};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "taskgate=info")
    // - LOG_FORMAT=json: JSON lines
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "taskgate" {
        telemetry_config.service_name = "taskgate-reaper".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("taskgate=info,taskgate_reaper=info".to_string());
    }
    init_tracing(&telemetry_config).context("Failed to initialize tracing")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let mut config = DispatchConfig::from_env();
    config.reaper_enabled = true;
    config.validate().context("Invalid dispatch configuration")?;

    tracing::info!(
        grace_ms = config.unack_grace_window.as_millis() as u64,
        interval_ms = config.reaper_interval.as_millis() as u64,
        "taskgate-reaper starting..."
    );

    let store = PostgresDispatchStore::connect(&database_url, max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Failed to run migrations")?;

    let queue = WorkQueue::new(Arc::new(store), config);

    // Release anything that expired while no reaper was running
    let released = queue
        .process_all_unacks()
        .await
        .context("Initial lease release failed")?;
    tracing::info!(released, "Initial pass complete");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    queue.shutdown().await;

    tracing::info!("Reaper shutdown complete");
    Ok(())
}
