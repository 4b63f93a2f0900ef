//! Fixed-rate frame driver.
//!
//! The producer publishes frames into a latest-wins slot; the driver wakes
//! at the configured rate and processes only the newest frame. Frames
//! overwritten before the driver saw them are counted as dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::metrics;
use crate::pipeline::{Frame, FramePipeline, FrameReport};

/// Producer half of the frame slot.
pub struct FrameSender {
    tx: watch::Sender<Option<Frame>>,
    next_index: AtomicU64,
}

impl FrameSender {
    /// Publish a frame, replacing any frame not yet processed.
    ///
    /// Frames are renumbered in publication order; returns the index used.
    pub fn publish(&self, mut frame: Frame) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        frame.index = index;
        self.tx.send_replace(Some(frame));
        index
    }

    /// Whether the driver has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn published(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }
}

/// Create a latest-wins frame slot.
pub fn frame_channel() -> (FrameSender, watch::Receiver<Option<Frame>>) {
    let (tx, rx) = watch::channel(None);
    (
        FrameSender {
            tx,
            next_index: AtomicU64::new(0),
        },
        rx,
    )
}

/// Totals for a driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub processed: u64,
    pub dropped: u64,
}

/// Drives a pipeline at a fixed rate from a frame slot.
pub struct FrameDriver {
    pipeline: FramePipeline,
    period: Duration,
    /// Index the next frame would have if none were dropped
    expected_index: u64,
    stats: DriverStats,
}

impl FrameDriver {
    pub fn new(pipeline: FramePipeline, period: Duration) -> Self {
        Self {
            pipeline,
            period,
            expected_index: 0,
            stats: DriverStats::default(),
        }
    }

    /// Driver ticking at the pipeline's configured rate.
    pub fn from_config(pipeline: FramePipeline) -> Self {
        let period = pipeline.config().driver.period();
        Self::new(pipeline, period)
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Process frames until `shutdown` flips to true or the producer is gone.
    ///
    /// `on_report` sees every frame report, in order.
    pub async fn run<F>(
        &mut self,
        mut frames: watch::Receiver<Option<Frame>>,
        mut shutdown: watch::Receiver<bool>,
        mut on_report: F,
    ) -> DriverStats
    where
        F: FnMut(FrameReport),
    {
        info!(period_ms = self.period.as_millis() as u64, "Frame driver started");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (frame, closed) = match frames.has_changed() {
                        Ok(true) => (frames.borrow_and_update().clone(), false),
                        Ok(false) => (None, false),
                        // Producer gone: take whatever it left behind, once
                        Err(_) => (frames.borrow().clone().filter(|f| f.index >= self.expected_index), true),
                    };

                    if let Some(frame) = frame {
                        on_report(self.process(frame).await);
                    }
                    if closed {
                        info!("Frame producer closed");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping frame driver");
                        break;
                    }
                }
            }
        }

        info!(
            processed = self.stats.processed,
            dropped = self.stats.dropped,
            "Frame driver stopped"
        );
        self.stats
    }

    /// Process one frame immediately, accounting for skipped indices.
    pub async fn process(&mut self, frame: Frame) -> FrameReport {
        let skipped = frame.index.saturating_sub(self.expected_index);
        if skipped > 0 {
            self.stats.dropped += skipped;
            metrics::record_frames_dropped(skipped);
            debug!(skipped, frame = frame.index, "Dropped stale frames");
        }
        self.expected_index = frame.index + 1;
        self.stats.processed += 1;

        self.pipeline.process(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackingConfig;
    use crate::pipeline_builder::PipelineBuilder;
    use chrono::Utc;

    fn driver(period: Duration) -> FrameDriver {
        let pipeline = PipelineBuilder::new(TrackingConfig::default()).build().unwrap();
        FrameDriver::new(pipeline, period)
    }

    #[tokio::test]
    async fn test_only_latest_frame_is_processed() {
        let (sender, frames) = frame_channel();
        for _ in 0..5 {
            sender.publish(Frame::new(0, Utc::now(), vec![]));
        }
        drop(sender);

        let (_shutdown_tx, shutdown) = watch::channel(false);
        let mut driver = driver(Duration::from_millis(5));
        let mut seen = Vec::new();
        let stats = driver.run(frames, shutdown, |report| seen.push(report.index)).await;

        assert_eq!(seen, vec![4]);
        assert_eq!(stats, DriverStats { processed: 1, dropped: 4 });
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let (sender, frames) = frame_channel();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let mut driver = driver(Duration::from_millis(5));

        let handle = tokio::spawn(async move { driver.run(frames, shutdown, |_| {}).await });
        sender.publish(Frame::new(0, Utc::now(), vec![]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert!(stats.processed <= 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(sender.published(), 1);
    }

    #[tokio::test]
    async fn test_process_counts_index_gaps() {
        let mut driver = driver(Duration::from_millis(100));
        driver.process(Frame::new(0, Utc::now(), vec![])).await;
        driver.process(Frame::new(3, Utc::now(), vec![])).await;

        assert_eq!(driver.stats(), DriverStats { processed: 2, dropped: 2 });
        assert_eq!(driver.pipeline().frames_processed(), 2);
    }
}
