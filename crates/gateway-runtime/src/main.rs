//! # Stream Gateway Runtime
//!
//! Long-running process that keeps the platform streams declared and drains
//! them through durable consumers.
//!
//! ## Startup Sequence
//!
//! 1. Initialise logging (`RUST_LOG`, default `info`)
//! 2. Load configuration from `GW_*` environment variables
//! 3. Connect to the bus
//! 4. Declare streams and spawn consumers
//! 5. Run until Ctrl-C, then shut down gracefully

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gateway_runtime::GatewayRuntime;
use shared_bus::{NatsBus, NatsBusConfig};
use stream_gateway::GatewayConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config = GatewayConfig::from_env().context("invalid GW_* configuration")?;
    info!(url = %config.bus.url, group = %config.consumer.group, "Configuration loaded");

    let bus = NatsBus::connect(&NatsBusConfig::from(&config.bus))
        .await
        .with_context(|| format!("failed to connect to {}", config.bus.url))?;

    let mut runtime = GatewayRuntime::new(Arc::new(bus), config)?;
    runtime.start().await?;

    info!("Gateway is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    for (group, report) in runtime.shutdown(SHUTDOWN_GRACE).await {
        info!(
            group = %group,
            acked = report.acked,
            redelivered = report.redelivery_requested,
            dead_lettered = report.dead_lettered,
            "Consumer totals"
        );
    }
    Ok(())
}
