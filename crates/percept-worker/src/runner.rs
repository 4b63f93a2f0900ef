//! Worker run loop.
//!
//! Wires the detection source, frame driver, maintenance cycle and
//! persistence sink together and tears them down in order:
//! source, then driver, then a final maintenance flush.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{info, warn};

use percept_tracking::{
    frame_channel, ColorHistogramExtractor, DriverStats, FeatureExtractor, FrameDriver, FramePipeline,
    MaintenanceCycle, NoopExtractor, OutboxStats, PersistenceSink, PipelineBuilder,
};

use crate::config::{ExtractorKind, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::FrameLogger;
use crate::sink::JsonLinesSink;
use crate::source::{open_input, replay, SourceStats};

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn install_metrics_exporter(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::metrics_failed(e.to_string()))?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Totals for a worker run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub source: SourceStats,
    pub driver: DriverStats,
    pub outbox: OutboxStats,
    /// Identities still in the short-term cache at exit
    pub identities_cached: usize,
    pub saves: u64,
}

/// The tracking worker.
pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Build the pipeline with the configured extractor.
    pub fn build_pipeline(&self) -> WorkerResult<FramePipeline> {
        let extractor: Arc<dyn FeatureExtractor> = match self.config.extractor {
            ExtractorKind::None => Arc::new(NoopExtractor),
            ExtractorKind::ColorHistogram => Arc::new(ColorHistogramExtractor::default()),
        };
        Ok(PipelineBuilder::new(self.config.tracking.clone())
            .extractor(extractor)
            .build()?)
    }

    /// Run until the input ends or `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerResult<RunSummary> {
        let source_name = self
            .config
            .input
            .as_ref()
            .map_or_else(|| "stdin".to_string(), |p| p.display().to_string());
        let logger = FrameLogger::new(&source_name, "track");
        logger.log_start(&format!(
            "extractor={}, output={}",
            self.config.extractor,
            self.config.output.display()
        ));

        let pipeline = self.build_pipeline()?;
        let classifier = pipeline.classifier().cloned();

        let sink: Arc<dyn PersistenceSink> = Arc::new(JsonLinesSink::open(&self.config.output).await?);
        let (maintenance_tx, maintenance_rx) = watch::channel(false);
        let maintenance = MaintenanceCycle::for_pipeline(&pipeline, sink)
            .spawn(self.config.tracking.maintenance.interval(), maintenance_rx);

        // Source task owns the sender; the driver stops once it is dropped
        let (sender, frames) = frame_channel();
        let reader = open_input(self.config.input.as_deref()).await?;
        let period = self.config.source_period();
        let load_images = self.config.extractor != ExtractorKind::None;
        let source_shutdown = shutdown.clone();
        let source = tokio::spawn(async move {
            replay(reader, &sender, period, load_images, source_shutdown).await
        });

        let mut driver = FrameDriver::from_config(pipeline);
        let driver_stats = driver
            .run(frames, shutdown, |report| logger.log_report(&report))
            .await;

        // A source blocked on input is abandoned on shutdown
        if !source.is_finished() {
            source.abort();
        }
        let source_stats = match source.await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                logger.log_warning(&format!("source stopped early: {}", e));
                if !e.is_recoverable() {
                    self.stop_maintenance(maintenance_tx, maintenance).await;
                    return Err(e);
                }
                SourceStats::default()
            }
            Err(e) if e.is_cancelled() => SourceStats::default(),
            Err(e) => return Err(WorkerError::task_failed(format!("source task failed: {}", e))),
        };

        self.stop_maintenance(maintenance_tx, maintenance).await;

        if let (Some(classifier), Some(path)) = (classifier, &self.config.tracking.recognition.model_path) {
            match classifier.save(path) {
                Ok(()) => info!(path = %path.display(), samples = classifier.len(), "Saved classifier"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to save classifier"),
            }
        }

        let pipeline = driver.pipeline();
        let summary = RunSummary {
            source: source_stats,
            driver: driver_stats,
            outbox: pipeline.outbox().stats(),
            identities_cached: pipeline.cache().len(),
            saves: pipeline.save_engine().stats().saved,
        };
        logger.log_completion(&format!(
            "frames={}, dropped={}, saves={}, delivered={}",
            summary.driver.processed, summary.driver.dropped, summary.saves, summary.outbox.delivered
        ));
        Ok(summary)
    }

    async fn stop_maintenance(&self, tx: watch::Sender<bool>, handle: tokio::task::JoinHandle<()>) {
        let _ = tx.send(true);
        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Maintenance task failed"),
            Err(_) => warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Maintenance did not finish before the shutdown timeout"
            ),
        }
    }
}
