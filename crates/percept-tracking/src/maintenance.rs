//! Periodic housekeeping outside the frame loop.
//!
//! Expires stale cache entries, prunes the recent-saves window and
//! flushes the persistence outbox to the sink. A failed flush puts its
//! batch back in the outbox for the next pass.
//!
//! Background passes run on the pipeline's [`FrameClock`], so expiry and
//! pruning use the same timeline as the frame timestamps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::ShortTermCache;
use crate::clock::FrameClock;
use crate::metrics;
use crate::outbox::PersistenceOutbox;
use crate::pipeline::FramePipeline;
use crate::providers::PersistenceSink;
use crate::save_decision::SaveDecisionEngine;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Cache entries removed by TTL
    pub expired: usize,
    /// Saves dropped from the recent window
    pub pruned: usize,
    /// Records delivered to the sink
    pub flushed: usize,
    /// Records whose flush failed and were requeued
    pub requeued: usize,
    /// Records lost because the outbox overflowed on requeue
    pub dropped: usize,
    /// Records still pending after the pass
    pub pending: usize,
    pub sink_error: Option<String>,
}

/// Background maintenance over the pipeline's shared state.
pub struct MaintenanceCycle {
    cache: Arc<ShortTermCache>,
    saves: Arc<SaveDecisionEngine>,
    outbox: Arc<PersistenceOutbox>,
    sink: Arc<dyn PersistenceSink>,
    clock: Arc<FrameClock>,
    flush_batch: usize,
}

impl MaintenanceCycle {
    pub fn new(
        cache: Arc<ShortTermCache>,
        saves: Arc<SaveDecisionEngine>,
        outbox: Arc<PersistenceOutbox>,
        sink: Arc<dyn PersistenceSink>,
        flush_batch: usize,
    ) -> Self {
        Self {
            cache,
            saves,
            outbox,
            sink,
            clock: Arc::new(FrameClock::new()),
            flush_batch: flush_batch.max(1),
        }
    }

    /// Read pass times from `clock` instead of a private one.
    pub fn with_clock(mut self, clock: Arc<FrameClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<FrameClock> {
        &self.clock
    }

    /// Maintenance over the state shared with `pipeline`.
    pub fn for_pipeline(pipeline: &FramePipeline, sink: Arc<dyn PersistenceSink>) -> Self {
        Self::new(
            Arc::clone(pipeline.cache()),
            Arc::clone(pipeline.save_engine()),
            Arc::clone(pipeline.outbox()),
            sink,
            pipeline.config().maintenance.flush_batch,
        )
        .with_clock(Arc::clone(pipeline.clock()))
    }

    /// Run one pass at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            expired: self.cache.expire(now),
            pruned: self.saves.prune(now),
            ..Default::default()
        };
        metrics::set_cache_size(self.cache.len());

        // Only what is pending now; records queued mid-flush wait for the next pass
        let mut remaining = self.outbox.len();
        while remaining > 0 {
            let batch = self.outbox.take_batch(self.flush_batch.min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();

            let count = batch.len();
            match self.sink.persist(&batch).await {
                Ok(()) => {
                    self.outbox.mark_delivered(count);
                    metrics::record_records_flushed(count as u64);
                    report.flushed += count;
                }
                Err(e) => {
                    metrics::record_sink_failure();
                    warn!(
                        sink = self.sink.name(),
                        records = count,
                        error = %e,
                        "Persistence flush failed, requeueing batch"
                    );
                    report.requeued += count;
                    report.dropped += self.outbox.requeue(batch);
                    report.sink_error = Some(e.to_string());
                    break;
                }
            }
        }
        report.pending = self.outbox.len();

        debug!(
            expired = report.expired,
            pruned = report.pruned,
            flushed = report.flushed,
            pending = report.pending,
            "Maintenance pass complete"
        );
        report
    }

    /// Run passes every `interval` until `shutdown` flips to true.
    ///
    /// A last pass runs on shutdown so pending records get one more
    /// chance to reach the sink.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, sink = self.sink.name(), "Maintenance started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once(self.clock.now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let last = self.run_once(self.clock.now()).await;
            info!(flushed = last.flushed, pending = last.pending, "Maintenance stopped");
        })
    }
}
