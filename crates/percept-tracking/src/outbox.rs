//! Bounded queue of records waiting for the persistence sink.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use percept_models::PersistenceRecord;
use serde::Serialize;
use tracing::warn;

use crate::metrics;

/// Outbox counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub requeued: u64,
    /// Records discarded because the outbox was full
    pub dropped: u64,
}

struct OutboxInner {
    pending: VecDeque<PersistenceRecord>,
    stats: OutboxStats,
}

/// Pending persistence records, oldest first.
///
/// When full, the oldest pending record is dropped to make room.
pub struct PersistenceOutbox {
    capacity: usize,
    inner: Mutex<OutboxInner>,
}

impl PersistenceOutbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(OutboxInner {
                pending: VecDeque::with_capacity(capacity),
                stats: OutboxStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a record. Returns how many old records were dropped.
    pub fn push(&self, record: PersistenceRecord) -> usize {
        let mut inner = self.lock();
        inner.pending.push_back(record);
        inner.stats.enqueued += 1;
        let dropped = Self::shed(&mut inner, self.capacity);
        drop(inner);

        self.report_dropped(dropped);
        dropped
    }

    /// Take up to `max` records from the front.
    pub fn take_batch(&self, max: usize) -> Vec<PersistenceRecord> {
        let mut inner = self.lock();
        let n = max.min(inner.pending.len());
        inner.pending.drain(..n).collect()
    }

    /// Put a failed batch back at the front, preserving order.
    ///
    /// If the outbox filled up in the meantime, the oldest records go first.
    pub fn requeue(&self, batch: Vec<PersistenceRecord>) -> usize {
        let mut inner = self.lock();
        inner.stats.requeued += batch.len() as u64;
        for record in batch.into_iter().rev() {
            inner.pending.push_front(record);
        }
        let dropped = Self::shed(&mut inner, self.capacity);
        drop(inner);

        self.report_dropped(dropped);
        dropped
    }

    /// Count records as delivered.
    pub fn mark_delivered(&self, count: usize) {
        self.lock().stats.delivered += count as u64;
    }

    fn shed(inner: &mut OutboxInner, capacity: usize) -> usize {
        let mut dropped = 0;
        while inner.pending.len() > capacity {
            inner.pending.pop_front();
            dropped += 1;
        }
        inner.stats.dropped += dropped as u64;
        dropped
    }

    fn report_dropped(&self, dropped: usize) {
        if dropped > 0 {
            warn!(dropped, capacity = self.capacity, "Persistence outbox full, dropped oldest records");
            metrics::record_outbox_dropped(dropped as u64);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> OutboxStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use percept_models::{BoundingBox, IdentityId, SaveReason};

    fn record(label: &str) -> PersistenceRecord {
        PersistenceRecord {
            identity_id: IdentityId::new(),
            label: label.to_string(),
            confidence: 0.8,
            bounding_box: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            class_index: 0,
            thumbnail: None,
            recognized_as: None,
            reason: SaveReason::FirstOfClass,
            timestamp: Utc::now(),
        }
    }

    fn labels(records: &[PersistenceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.label.as_str()).collect()
    }

    #[test]
    fn test_full_outbox_drops_oldest() {
        let outbox = PersistenceOutbox::new(2);
        assert_eq!(outbox.push(record("a")), 0);
        assert_eq!(outbox.push(record("b")), 0);
        assert_eq!(outbox.push(record("c")), 1);

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.stats().dropped, 1);
        assert_eq!(labels(&outbox.take_batch(10)), vec!["b", "c"]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_requeue_preserves_order() {
        let outbox = PersistenceOutbox::new(10);
        for label in ["a", "b", "c"] {
            outbox.push(record(label));
        }

        let batch = outbox.take_batch(2);
        assert_eq!(labels(&batch), vec!["a", "b"]);
        outbox.push(record("d"));
        outbox.requeue(batch);

        assert_eq!(labels(&outbox.take_batch(10)), vec!["a", "b", "c", "d"]);
        assert_eq!(outbox.stats().requeued, 2);
    }

    #[test]
    fn test_requeue_into_full_outbox_sheds_oldest() {
        let outbox = PersistenceOutbox::new(2);
        outbox.push(record("a"));
        let batch = outbox.take_batch(1);
        outbox.push(record("b"));
        outbox.push(record("c"));

        assert_eq!(outbox.requeue(batch), 1);
        assert_eq!(labels(&outbox.take_batch(10)), vec!["b", "c"]);
    }
}
