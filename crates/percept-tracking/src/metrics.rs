//! Metrics for the tracking pipeline.
//!
//! Recorded through the `metrics` facade; the worker decides which exporter
//! (if any) is installed.

use metrics::{counter, gauge, histogram};
use percept_models::SaveReason;

/// Metric names as constants for consistency.
pub mod names {
    // Frame cycle
    pub const FRAMES_PROCESSED_TOTAL: &str = "percept_frames_processed_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "percept_frames_dropped_total";
    pub const FRAME_DURATION_SECONDS: &str = "percept_frame_duration_seconds";
    pub const DETECTIONS_REJECTED_TOTAL: &str = "percept_detections_rejected_total";

    // Stabilizer
    pub const TRACKS_CONFIRMED: &str = "percept_tracks_confirmed";
    pub const TRACKS_CANDIDATE: &str = "percept_tracks_candidate";
    pub const TRACKS_EVICTED_TOTAL: &str = "percept_tracks_evicted_total";

    // Identities and cache
    pub const IDENTITIES_MINTED_TOTAL: &str = "percept_identities_minted_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "percept_cache_evictions_total";
    pub const CACHE_EXPIRED_TOTAL: &str = "percept_cache_expired_total";
    pub const CACHE_SIZE: &str = "percept_cache_size";

    // Attention
    pub const ATTENTION_CAPACITY: &str = "percept_attention_capacity";
    pub const EXTRACTION_FAILURES_TOTAL: &str = "percept_extraction_failures_total";

    // Persistence
    pub const SAVES_TOTAL: &str = "percept_saves_total";
    pub const SAVE_SKIPS_TOTAL: &str = "percept_save_skips_total";
    pub const OUTBOX_DROPPED_TOTAL: &str = "percept_outbox_dropped_total";
    pub const SINK_FAILURES_TOTAL: &str = "percept_sink_failures_total";
    pub const RECORDS_FLUSHED_TOTAL: &str = "percept_records_flushed_total";
}

/// Record a completed frame cycle.
pub fn record_frame(duration_secs: f64) {
    counter!(names::FRAMES_PROCESSED_TOTAL).increment(1);
    histogram!(names::FRAME_DURATION_SECONDS).record(duration_secs);
}

/// Record frames superseded before they were processed.
pub fn record_frames_dropped(count: u64) {
    if count > 0 {
        counter!(names::FRAMES_DROPPED_TOTAL).increment(count);
    }
}

/// Record detections discarded during sanitizing.
pub fn record_detections_rejected(count: u64) {
    if count > 0 {
        counter!(names::DETECTIONS_REJECTED_TOTAL).increment(count);
    }
}

/// Update stabilizer pool gauges.
pub fn set_track_pools(confirmed: usize, candidates: usize) {
    gauge!(names::TRACKS_CONFIRMED).set(confirmed as f64);
    gauge!(names::TRACKS_CANDIDATE).set(candidates as f64);
}

/// Record tracks evicted by a pool cap.
pub fn record_tracks_evicted(pool: &str, count: u64) {
    if count > 0 {
        let labels = [("pool", pool.to_string())];
        counter!(names::TRACKS_EVICTED_TOTAL, &labels).increment(count);
    }
}

/// Record newly minted identities.
pub fn record_identities_minted(count: u64) {
    if count > 0 {
        counter!(names::IDENTITIES_MINTED_TOTAL).increment(count);
    }
}

/// Record LRU evictions from the short-term cache.
pub fn record_cache_evictions(count: u64) {
    if count > 0 {
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(count);
    }
}

/// Record entries removed by TTL expiry.
pub fn record_cache_expired(count: u64) {
    if count > 0 {
        counter!(names::CACHE_EXPIRED_TOTAL).increment(count);
    }
}

/// Update the cache size gauge.
pub fn set_cache_size(size: usize) {
    gauge!(names::CACHE_SIZE).set(size as f64);
}

/// Update the attention capacity gauge.
pub fn set_attention_capacity(capacity: usize) {
    gauge!(names::ATTENTION_CAPACITY).set(capacity as f64);
}

/// Record a failed signature extraction.
pub fn record_extraction_failure() {
    counter!(names::EXTRACTION_FAILURES_TOTAL).increment(1);
}

/// Record a save decision.
pub fn record_save_decision(reason: SaveReason) {
    let labels = [("reason", reason.as_str().to_string())];
    if reason.is_save() {
        counter!(names::SAVES_TOTAL, &labels).increment(1);
    } else {
        counter!(names::SAVE_SKIPS_TOTAL, &labels).increment(1);
    }
}

/// Record records dropped from a full outbox.
pub fn record_outbox_dropped(count: u64) {
    if count > 0 {
        counter!(names::OUTBOX_DROPPED_TOTAL).increment(count);
    }
}

/// Record a failed sink flush.
pub fn record_sink_failure() {
    counter!(names::SINK_FAILURES_TOTAL).increment(1);
}

/// Record records delivered to the sink.
pub fn record_records_flushed(count: u64) {
    if count > 0 {
        counter!(names::RECORDS_FLUSHED_TOTAL).increment(count);
    }
}
