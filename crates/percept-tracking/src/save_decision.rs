//! Save decision engine.
//!
//! Decides whether an observation is worth persisting. Recent saves are
//! kept in a small rolling index; each new observation is compared with
//! its nearest same-label neighbours by visual signature (cosine) or, when
//! a side has no signature, by a blend of IoU and confidence closeness.
//!
//! # Decision order
//! 1. No recent save of the label: save (`first-of-class`)
//! 2. A neighbour above the similarity threshold inside the cooldown: skip
//! 3. Save when confidence improved, the box moved, the best match is due
//!    a refresh, or the confidence tier is new for the label
//! 4. Otherwise skip
//!
//! Deciding and recording a save happen under one lock, so two concurrent
//! callers can never both save the same near-duplicate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use percept_models::{BoundingBox, IdentityId, SaveReason};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SaveDecisionConfig;
use crate::metrics;
use crate::similarity::{cosine_similarity, top_k};

/// Coarse confidence bucket used to detect new tiers per label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn from_confidence(confidence: f64, bounds: [f64; 2]) -> Self {
        if confidence < bounds[0] {
            ConfidenceTier::Low
        } else if confidence < bounds[1] {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::High
        }
    }
}

/// Immutable fact about a past save.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveRecord {
    pub identity_id: IdentityId,
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub signature: Option<Vec<f32>>,
    pub saved_at: DateTime<Utc>,
}

/// Whether a visual signature backs an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// A signature was computed
    Available,
    /// No extractor configured; compare geometrically
    NotConfigured,
    /// The extractor failed for this observation
    Failed,
}

/// An observation offered to the engine.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub identity_id: IdentityId,
    pub label: &'a str,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub signature: Option<&'a [f32]>,
    pub signature_status: SignatureStatus,
}

/// Nearest recent save considered by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BestMatch {
    pub similarity: f64,
    pub age_secs: f64,
    pub confidence: f64,
}

/// Outcome of evaluating an observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveDecision {
    pub save: bool,
    pub reason: SaveReason,
    pub best_match: Option<BestMatch>,
}

impl SaveDecision {
    fn new(reason: SaveReason, best_match: Option<BestMatch>) -> Self {
        Self {
            save: reason.is_save(),
            reason,
            best_match,
        }
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveStats {
    pub evaluated: u64,
    pub saved: u64,
    pub skipped: u64,
    pub pruned: u64,
    pub by_reason: HashMap<SaveReason, u64>,
}

struct RecentSaves {
    records: VecDeque<SaveRecord>,
    stats: SaveStats,
}

/// Per-observation save/deduplication decisions.
pub struct SaveDecisionEngine {
    config: SaveDecisionConfig,
    recent: Mutex<RecentSaves>,
}

impl SaveDecisionEngine {
    pub fn new(config: SaveDecisionConfig) -> Self {
        Self {
            recent: Mutex::new(RecentSaves {
                records: VecDeque::with_capacity(config.max_records),
                stats: SaveStats::default(),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecentSaves> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether to save an observation, recording it when saved.
    pub fn decide(&self, observation: &Observation<'_>, now: DateTime<Utc>) -> SaveDecision {
        let mut recent = self.lock();
        let pruned = self.prune_locked(&mut recent, now);
        recent.stats.pruned += pruned as u64;

        let decision = self.evaluate_locked(&recent.records, observation, now);

        recent.stats.evaluated += 1;
        *recent.stats.by_reason.entry(decision.reason).or_insert(0) += 1;
        if decision.save {
            recent.stats.saved += 1;
            recent.records.push_back(SaveRecord {
                identity_id: observation.identity_id,
                label: observation.label.to_string(),
                confidence: observation.confidence.clamp(0.0, 1.0),
                bounding_box: observation.bounding_box,
                signature: observation.signature.map(<[f32]>::to_vec),
                saved_at: now,
            });
            while recent.records.len() > self.config.max_records {
                recent.records.pop_front();
                recent.stats.pruned += 1;
            }
        } else {
            recent.stats.skipped += 1;
        }
        drop(recent);

        metrics::record_save_decision(decision.reason);
        if decision.save {
            info!(
                identity_id = %observation.identity_id,
                label = observation.label,
                confidence = observation.confidence,
                reason = %decision.reason,
                "Saving observation"
            );
        } else {
            debug!(
                identity_id = %observation.identity_id,
                label = observation.label,
                reason = %decision.reason,
                "Observation not saved"
            );
        }

        decision
    }

    fn evaluate_locked(
        &self,
        records: &VecDeque<SaveRecord>,
        observation: &Observation<'_>,
        now: DateTime<Utc>,
    ) -> SaveDecision {
        let c = &self.config;
        let same_label: Vec<&SaveRecord> =
            records.iter().filter(|r| r.label == observation.label).collect();

        // 1. First of class
        if same_label.is_empty() {
            return SaveDecision::new(SaveReason::FirstOfClass, None);
        }

        let age_secs = |record: &SaveRecord| (now - record.saved_at).num_milliseconds() as f64 / 1000.0;
        let cooldown_secs = c.cooldown().num_milliseconds() as f64 / 1000.0;

        // A failed extraction saves unless the label was saved moments ago
        if observation.signature_status == SignatureStatus::Failed && c.save_on_signature_failure {
            let recently_saved = same_label.iter().any(|&r| age_secs(r) < cooldown_secs);
            if !recently_saved {
                return SaveDecision::new(SaveReason::SignatureUnavailable, None);
            }
        }

        let neighbours = top_k(&same_label, c.neighbors.max(1), |r| self.similarity(observation, r));
        let summary = |index: usize, similarity: f64| {
            let record = same_label[index];
            BestMatch {
                similarity,
                age_secs: age_secs(record),
                confidence: record.confidence,
            }
        };

        // 2. Too similar, too recent
        for &(index, similarity) in &neighbours {
            if similarity > c.similarity_threshold && age_secs(same_label[index]) < cooldown_secs {
                return SaveDecision::new(SaveReason::TooSimilarRecent, Some(summary(index, similarity)));
            }
        }

        let Some(&(best_index, best_similarity)) = neighbours.first() else {
            return SaveDecision::new(SaveReason::FirstOfClass, None);
        };
        let best = same_label[best_index];
        let best_match = Some(summary(best_index, best_similarity));

        // 3. Significant change
        if observation.confidence - best.confidence > c.confidence_delta {
            return SaveDecision::new(SaveReason::ConfidenceImproved, best_match);
        }
        if observation.bounding_box.iou(&best.bounding_box) < c.movement_iou_threshold {
            return SaveDecision::new(SaveReason::SignificantMovement, best_match);
        }
        if age_secs(best) > c.refresh().num_milliseconds() as f64 / 1000.0 {
            return SaveDecision::new(SaveReason::PeriodicRefresh, best_match);
        }
        let tier = ConfidenceTier::from_confidence(observation.confidence, c.confidence_tiers);
        let tier_seen = same_label
            .iter()
            .any(|r| ConfidenceTier::from_confidence(r.confidence, c.confidence_tiers) == tier);
        if !tier_seen {
            return SaveDecision::new(SaveReason::NewConfidenceTier, best_match);
        }

        // 4. Nothing changed enough
        SaveDecision::new(SaveReason::NotSignificant, best_match)
    }

    /// Similarity between an observation and a recent save.
    ///
    /// Cosine of the signatures when both exist, otherwise a blend of IoU
    /// and confidence closeness.
    pub fn similarity(&self, observation: &Observation<'_>, record: &SaveRecord) -> f64 {
        if let (Some(a), Some(b)) = (observation.signature, record.signature.as_deref()) {
            return cosine_similarity(a, b);
        }

        let w = self.config.geometric_iou_weight;
        let iou = observation.bounding_box.iou(&record.bounding_box);
        let closeness = 1.0 - (observation.confidence - record.confidence).abs().min(1.0);
        let similarity = w * iou + (1.0 - w) * closeness;
        if similarity.is_finite() {
            similarity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn prune_locked(&self, recent: &mut RecentSaves, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.window();
        let before = recent.records.len();
        recent.records.retain(|r| r.saved_at >= cutoff);
        while recent.records.len() > self.config.max_records {
            recent.records.pop_front();
        }
        before - recent.records.len()
    }

    /// Drop saves outside the window. Returns the number dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut recent = self.lock();
        let pruned = self.prune_locked(&mut recent, now);
        recent.stats.pruned += pruned as u64;
        pruned
    }

    /// Copy of the recent saves, oldest first.
    pub fn records(&self) -> Vec<SaveRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SaveStats {
        self.lock().stats.clone()
    }

    pub fn config(&self) -> &SaveDecisionConfig {
        &self.config
    }
}

impl Default for SaveDecisionEngine {
    fn default() -> Self {
        Self::new(SaveDecisionConfig::default())
    }
}
