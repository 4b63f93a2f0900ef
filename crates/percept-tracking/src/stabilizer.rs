//! Detection stabilizer.
//!
//! Turns noisy per-frame detections into stable tracks.
//!
//! # Lifecycle
//! ```text
//! Candidate --(streak >= min_confirm_streak)--> Confirmed
//! Confirmed --(miss)--> Missing --(match)--> Confirmed
//! Missing --(misses > max_misses)--> Dead (removed)
//! ```
//!
//! Candidates live in their own pool and are grouped by label and IoU.
//! Confirmed and Missing tracks are matched with a combined score of IoU
//! against the predicted box, center proximity and size ratio.

use percept_models::{BoundingBox, Detection, Velocity};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::StabilizerConfig;
use crate::metrics;

/// Lifecycle state of a stabilized track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Candidate,
    Confirmed,
    Missing,
    Dead,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Candidate => "candidate",
            TrackState::Confirmed => "confirmed",
            TrackState::Missing => "missing",
            TrackState::Dead => "dead",
        }
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A smoothed track produced by the stabilizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizedTrack {
    /// Internal track identifier, unique per stabilizer
    pub id: u64,
    pub label: String,
    pub class_index: i32,
    /// Smoothed box
    pub bounding_box: BoundingBox,
    /// Smoothed confidence (0.0-1.0)
    pub confidence: f64,
    /// Box extrapolated one frame ahead
    pub predicted_box: BoundingBox,
    /// Center displacement per frame
    pub velocity: Velocity,
    pub state: TrackState,
    /// Consecutive frames with a match
    pub streak: u32,
    /// Consecutive frames without a match
    pub misses: u32,
    /// Total frames with a match
    pub observations: u32,
    /// Frame on which the track was created
    pub created_frame: u64,
}

impl StabilizedTrack {
    fn from_detection(id: u64, detection: &Detection, frame: u64) -> Self {
        Self {
            id,
            label: detection.label.clone(),
            class_index: detection.class_index,
            bounding_box: detection.bounding_box,
            confidence: detection.confidence,
            predicted_box: detection.bounding_box,
            velocity: Velocity::default(),
            state: TrackState::Candidate,
            streak: 1,
            misses: 0,
            observations: 1,
            created_frame: frame,
        }
    }

    /// Fold a matched detection into the track.
    fn observe(&mut self, detection: &Detection, config: &StabilizerConfig) {
        let previous = self.bounding_box;

        self.bounding_box = previous.blend(&detection.bounding_box, config.position_retain);
        self.confidence = (self.confidence * config.confidence_retain
            + detection.confidence * (1.0 - config.confidence_retain))
            .clamp(0.0, 1.0);
        self.velocity = Velocity::between(&previous, &self.bounding_box);
        self.predicted_box = self.bounding_box.translate(self.velocity);
        self.class_index = detection.class_index;

        self.streak += 1;
        self.observations += 1;
        self.misses = 0;
    }

    /// Account for a frame without a matching detection.
    fn miss(&mut self, config: &StabilizerConfig) {
        self.misses += 1;
        self.streak = 0;
        self.confidence = (self.confidence * config.miss_decay).clamp(0.0, 1.0);

        if self.misses <= config.max_predicted_misses {
            self.bounding_box = self.predicted_box;
            self.predicted_box = self.bounding_box.translate(self.velocity);
        }
    }
}

/// Running stabilizer statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StabilizerStats {
    pub frames: u64,
    pub candidates_created: u64,
    pub promotions: u64,
    pub promotions_skipped: u64,
    pub tracks_removed: u64,
    pub candidates_dropped: u64,
    pub tracks_evicted: u64,
    pub candidates_evicted: u64,
    pub detections_rejected: u64,
}

/// Multi-object detection stabilizer.
pub struct Stabilizer {
    config: StabilizerConfig,
    /// Confirmed and Missing tracks
    tracks: Vec<StabilizedTrack>,
    /// Candidate tracks awaiting promotion
    candidates: Vec<StabilizedTrack>,
    next_track_id: u64,
    stats: StabilizerStats,
}

impl Stabilizer {
    /// Create a stabilizer with default configuration.
    pub fn new() -> Self {
        Self::with_config(StabilizerConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: StabilizerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            candidates: Vec::new(),
            next_track_id: 0,
            stats: StabilizerStats::default(),
        }
    }

    /// Process one frame of raw detections.
    ///
    /// Returns the Confirmed tracks observed this frame whose confidence is
    /// at least the output floor.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<StabilizedTrack> {
        self.stats.frames += 1;
        let frame = self.stats.frames;

        let sanitized: Vec<Detection> = detections.iter().filter_map(|d| d.sanitized()).collect();
        self.record_rejected(detections.len() - sanitized.len());
        let detections = sanitized;

        // Match against Confirmed and Missing tracks
        let mut claimed = vec![false; self.tracks.len()];
        let mut unmatched = Vec::new();
        for detection in &detections {
            match self.best_track_for(detection, &claimed) {
                Some(index) => {
                    claimed[index] = true;
                    let track = &mut self.tracks[index];
                    if track.state == TrackState::Missing {
                        debug!(track_id = track.id, label = %track.label, "Track re-acquired");
                    }
                    track.observe(detection, &self.config);
                    track.state = TrackState::Confirmed;
                }
                None => unmatched.push(detection),
            }
        }

        // Unmatched tracks go missing
        for (track, was_claimed) in self.tracks.iter_mut().zip(&claimed) {
            if !was_claimed {
                track.miss(&self.config);
                track.state = TrackState::Missing;
            }
        }

        self.reinforce_candidates(&unmatched, frame);
        self.promote_candidates();
        self.remove_dead_tracks();
        self.enforce_caps();

        metrics::set_track_pools(self.tracks.len(), self.candidates.len());

        self.tracks
            .iter()
            .filter(|t| {
                t.state == TrackState::Confirmed
                    && t.confidence >= self.config.output_confidence_floor
            })
            .cloned()
            .collect()
    }

    /// Combined match score of a detection against a track's predicted box.
    pub fn match_score(&self, predicted: &BoundingBox, detection: &BoundingBox) -> f64 {
        let score = self.config.iou_weight * predicted.iou(detection)
            + self.config.center_weight * (1.0 - predicted.normalized_center_distance(detection))
            + self.config.size_weight * predicted.size_ratio(detection);
        if score.is_finite() {
            score
        } else {
            0.0
        }
    }

    fn best_track_for(&self, detection: &Detection, claimed: &[bool]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;

        for (index, track) in self.tracks.iter().enumerate() {
            if claimed[index] || track.label != detection.label {
                continue;
            }

            let score = self.match_score(&track.predicted_box, &detection.bounding_box);
            if score <= self.config.match_threshold {
                continue;
            }

            // Strict comparison keeps the first track found on an exact tie
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }

        best.map(|(index, _)| index)
    }

    /// Reinforce or create candidates from detections no track claimed.
    fn reinforce_candidates(&mut self, unmatched: &[&Detection], frame: u64) {
        let existing = self.candidates.len();
        let mut reinforced = vec![false; existing];

        for detection in unmatched {
            let mut best: Option<(usize, f64)> = None;
            for (index, candidate) in self.candidates[..existing].iter().enumerate() {
                if reinforced[index] || candidate.label != detection.label {
                    continue;
                }
                let iou = candidate.bounding_box.iou(&detection.bounding_box);
                if iou > self.config.candidate_iou_threshold
                    && best.map_or(true, |(_, best_iou)| iou > best_iou)
                {
                    best = Some((index, iou));
                }
            }

            match best {
                Some((index, _)) => {
                    reinforced[index] = true;
                    self.candidates[index].observe(detection, &self.config);
                }
                None => {
                    let track = StabilizedTrack::from_detection(self.next_track_id, detection, frame);
                    self.next_track_id += 1;
                    self.stats.candidates_created += 1;
                    self.candidates.push(track);
                }
            }
        }

        // Candidates missed this frame lose their streak
        for (candidate, hit) in self.candidates[..existing].iter_mut().zip(&reinforced) {
            if !hit {
                candidate.miss(&self.config);
            }
        }

        let max_misses = self.config.candidate_max_misses;
        let before = self.candidates.len();
        self.candidates.retain(|c| c.misses <= max_misses);
        self.stats.candidates_dropped += (before - self.candidates.len()) as u64;
    }

    fn promote_candidates(&mut self) {
        let min_streak = self.config.min_confirm_streak;
        let mut remaining = Vec::with_capacity(self.candidates.len());

        for mut candidate in std::mem::take(&mut self.candidates) {
            if candidate.streak < min_streak {
                remaining.push(candidate);
                continue;
            }

            if self.tracks.len() >= self.config.max_confirmed {
                self.stats.promotions_skipped += 1;
                remaining.push(candidate);
                continue;
            }

            candidate.state = TrackState::Confirmed;
            debug!(
                track_id = candidate.id,
                label = %candidate.label,
                streak = candidate.streak,
                "Candidate promoted"
            );
            self.stats.promotions += 1;
            self.tracks.push(candidate);
        }

        self.candidates = remaining;
    }

    fn remove_dead_tracks(&mut self) {
        let max_misses = self.config.max_misses;
        let mut removed = 0u64;

        self.tracks.retain_mut(|track| {
            if track.misses > max_misses {
                track.state = TrackState::Dead;
                debug!(track_id = track.id, label = %track.label, "Track removed");
                removed += 1;
                false
            } else {
                true
            }
        });

        self.stats.tracks_removed += removed;
    }

    fn enforce_caps(&mut self) {
        let evicted = evict_over_cap(&mut self.candidates, self.config.max_candidates);
        if evicted > 0 {
            self.stats.candidates_evicted += evicted;
            metrics::record_tracks_evicted("candidate", evicted);
        }

        let evicted = evict_over_cap(&mut self.tracks, self.config.max_confirmed);
        if evicted > 0 {
            self.stats.tracks_evicted += evicted;
            metrics::record_tracks_evicted("confirmed", evicted);
        }
    }

    /// IDs of every Confirmed or Missing track.
    pub fn live_track_ids(&self) -> Vec<u64> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    /// Confirmed and Missing tracks.
    pub fn tracks(&self) -> &[StabilizedTrack] {
        &self.tracks
    }

    /// Candidate tracks.
    pub fn candidates(&self) -> &[StabilizedTrack] {
        &self.candidates
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .count()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn stats(&self) -> &StabilizerStats {
        &self.stats
    }

    /// Record detections rejected before stabilizing.
    fn record_rejected(&mut self, count: usize) {
        if count > 0 {
            self.stats.detections_rejected += count as u64;
            metrics::record_detections_rejected(count as u64);
        }
    }
}

impl Default for Stabilizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Evict lowest-confidence tracks, oldest first on ties, until the pool fits.
fn evict_over_cap(pool: &mut Vec<StabilizedTrack>, cap: usize) -> u64 {
    let mut evicted = 0;
    while pool.len() > cap {
        let victim = pool
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(a.created_frame.cmp(&b.created_frame))
                    .then(a.id.cmp(&b.id))
            })
            .map(|(index, _)| index);

        match victim {
            Some(index) => {
                pool.remove(index);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}
