//! # Delivery Runtime
//!
//! Entry point: initializes telemetry, runs the reference scenario against a
//! transacted topic, then shuts down (or keeps consuming with
//! `TD_KEEP_RUNNING=true` until Ctrl+C).

use anyhow::{Context, Result};
use delivery_runtime::{load_config, DeliveryRuntime};
use delivery_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry =
        init_telemetry(TelemetryConfig::from_env()).context("Failed to initialize telemetry")?;

    let config = load_config()?;
    info!("===========================================");
    info!("  Transacted Delivery Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    let mut runtime = DeliveryRuntime::new(config)?;
    runtime.start().await?;

    match runtime.run_scenario().await {
        Ok(report) => info!(received = ?report.received, "Reference scenario passed"),
        Err(err) => {
            error!(error = %format!("{err:#}"), "Reference scenario failed");
            runtime.shutdown().await?;
            return Err(err);
        }
    }

    if runtime.config().keep_running {
        info!("Runtime is running. Press Ctrl+C to stop.");
        let mut ticker = tokio::time::interval(runtime.config().metrics_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => runtime.publish_metrics(),
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl+C")?;
                    break;
                }
            }
        }
    }

    let summary = runtime.shutdown().await?;
    if let Ok(metrics) = delivery_telemetry::encode_metrics() {
        debug!(metrics = %metrics, "Final metrics");
    }
    info!(summary = ?summary, "Exiting");
    Ok(())
}
