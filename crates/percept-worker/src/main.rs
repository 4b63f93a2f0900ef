//! Tracking worker binary.

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use percept_worker::{init_logging, install_metrics_exporter, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_logging()?;
    info!("Starting percept-worker");

    let config = WorkerConfig::from_env().context("failed to load worker config")?;
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        install_metrics_exporter(addr)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(config);
    let run = worker.run(shutdown_rx);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    match result {
        Ok(summary) => {
            info!(
                lines = summary.source.lines,
                rejected = summary.source.rejected,
                processed = summary.driver.processed,
                dropped = summary.driver.dropped,
                saves = summary.saves,
                delivered = summary.outbox.delivered,
                pending_dropped = summary.outbox.dropped,
                "Worker shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!("Worker error: {}", e);
            Err(e.into())
        }
    }
}
