//! Attention scheduling.
//!
//! Ranks tracked identities and picks the subset that gets expensive
//! downstream work this frame. The subset size shrinks under CPU, memory
//! and thermal pressure.

use percept_models::{IdentityId, MemoryPressure, ResourceState, ThermalState};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::config::AttentionConfig;
use crate::identity::TrackedIdentity;

/// Largest distance from the frame center to a corner.
const MAX_CENTER_DISTANCE: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Per-factor breakdown of an attention score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AttentionScore {
    pub size: f64,
    pub confidence: f64,
    pub center: f64,
    pub motion: f64,
    pub novelty: f64,
    /// Weighted total
    pub total: f64,
}

/// An identity selected for processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledIdentity {
    pub identity_id: IdentityId,
    pub label: String,
    pub score: AttentionScore,
}

/// Scores identities and bounds how many are processed per frame.
pub struct AttentionScheduler {
    config: AttentionConfig,
    /// How often each label has been seen
    label_counts: HashMap<String, u64>,
}

impl AttentionScheduler {
    pub fn new(config: AttentionConfig) -> Self {
        Self {
            config,
            label_counts: HashMap::new(),
        }
    }

    /// Processing capacity under the given resource state.
    ///
    /// Each pressure dimension applies its own multiplier to the base
    /// capacity; the result never drops below the configured minimum.
    pub fn capacity(&self, resources: &ResourceState) -> usize {
        let c = &self.config;
        let mut factor = 1.0;

        let cpu = resources.cpu_fraction();
        if cpu > 0.8 {
            factor *= c.cpu_critical_factor;
        } else if cpu > 0.6 {
            factor *= c.cpu_high_factor;
        }

        factor *= match resources.memory_pressure {
            MemoryPressure::Normal => 1.0,
            MemoryPressure::Warning => c.memory_warning_factor,
            MemoryPressure::Critical => c.memory_critical_factor,
        };

        factor *= match resources.thermal_state {
            ThermalState::Nominal => 1.0,
            ThermalState::Fair => c.thermal_fair_factor,
            ThermalState::Serious => c.thermal_serious_factor,
            ThermalState::Critical => c.thermal_critical_factor,
        };

        let capacity = (c.base_capacity as f64 * factor).floor() as usize;
        capacity.max(c.min_capacity)
    }

    /// Score one identity against the current label frequencies.
    pub fn score(&self, identity: &TrackedIdentity) -> AttentionScore {
        let c = &self.config;

        let size = identity.bounding_box.area().sqrt().clamp(0.0, 1.0);
        let confidence = identity.confidence.clamp(0.0, 1.0);

        let (cx, cy) = identity.bounding_box.center();
        let from_center = ((cx - 0.5).powi(2) + (cy - 0.5).powi(2)).sqrt();
        let center = if from_center.is_finite() {
            (1.0 - from_center / MAX_CENTER_DISTANCE).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let motion = match identity.last_displacement {
            Some(d) if d.is_finite() && c.motion_normalization > 0.0 => {
                (d / c.motion_normalization).clamp(0.0, 1.0)
            }
            Some(_) => 0.0,
            None => c.new_object_motion,
        };

        let seen = self.label_counts.get(&identity.label).copied().unwrap_or(0).max(1);
        let novelty = 1.0 / (1.0 + (seen as f64).ln());

        let total = c.size_weight * size
            + c.confidence_weight * confidence
            + c.center_weight * center
            + c.motion_weight * motion
            + c.novelty_weight * novelty;

        AttentionScore {
            size,
            confidence,
            center,
            motion,
            novelty,
            total: if total.is_finite() { total } else { 0.0 },
        }
    }

    /// Pick the identities to process this frame, best first.
    ///
    /// Identities below the confidence floor are dropped before scoring.
    /// Every identity passed in counts towards its label's frequency.
    pub fn schedule(
        &mut self,
        identities: &[TrackedIdentity],
        resources: &ResourceState,
    ) -> Vec<ScheduledIdentity> {
        for identity in identities {
            *self.label_counts.entry(identity.label.clone()).or_insert(0) += 1;
        }

        let capacity = self.capacity(resources);

        let mut scored: Vec<ScheduledIdentity> = identities
            .iter()
            .filter(|i| i.confidence >= self.config.min_confidence)
            .map(|i| ScheduledIdentity {
                identity_id: i.id,
                label: i.label.clone(),
                score: self.score(i),
            })
            .collect();

        let eligible = scored.len();
        scored.sort_by(|a, b| b.score.total.total_cmp(&a.score.total));
        scored.truncate(capacity);

        debug!(
            identities = identities.len(),
            eligible,
            capacity,
            scheduled = scored.len(),
            "Attention scheduled"
        );

        scored
    }

    /// Times a label has been seen.
    pub fn label_frequency(&self, label: &str) -> u64 {
        self.label_counts.get(label).copied().unwrap_or(0)
    }
}

impl Default for AttentionScheduler {
    fn default() -> Self {
        Self::new(AttentionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use percept_models::BoundingBox;

    fn identity(label: &str, confidence: f64, bbox: BoundingBox) -> TrackedIdentity {
        TrackedIdentity {
            id: IdentityId::new(),
            label: label.to_string(),
            class_index: 0,
            bounding_box: bbox,
            confidence,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            observations: 1,
            signature: None,
            motion: None,
            last_displacement: None,
            recognized_as: None,
        }
    }

    fn centered(size: f64) -> BoundingBox {
        BoundingBox::from_center(0.5, 0.5, size, size)
    }

    #[test]
    fn test_nominal_capacity_is_base() {
        let scheduler = AttentionScheduler::default();
        assert_eq!(scheduler.capacity(&ResourceState::nominal()), 10);
    }

    #[test]
    fn test_capacity_decreases_with_pressure() {
        let scheduler = AttentionScheduler::default();
        let mut previous = scheduler.capacity(&ResourceState::nominal());

        for thermal in &ThermalState::ALL[1..] {
            let capacity = scheduler.capacity(&ResourceState::nominal().with_thermal(*thermal));
            assert!(capacity < previous, "{} should reduce capacity", thermal);
            previous = capacity;
        }

        let normal = scheduler.capacity(&ResourceState::nominal());
        let warning = scheduler.capacity(&ResourceState::nominal().with_memory(MemoryPressure::Warning));
        let critical = scheduler.capacity(&ResourceState::nominal().with_memory(MemoryPressure::Critical));
        assert!(normal > warning && warning > critical);

        let idle = scheduler.capacity(&ResourceState::nominal().with_cpu(0.3));
        let busy = scheduler.capacity(&ResourceState::nominal().with_cpu(0.7));
        let saturated = scheduler.capacity(&ResourceState::nominal().with_cpu(0.9));
        assert!(idle > busy && busy > saturated);
    }

    #[test]
    fn test_capacity_floor() {
        let scheduler = AttentionScheduler::default();
        let worst = ResourceState::nominal()
            .with_cpu(0.95)
            .with_memory(MemoryPressure::Critical)
            .with_thermal(ThermalState::Critical);
        assert_eq!(scheduler.capacity(&worst), 1);
    }

    #[test]
    fn test_schedule_never_exceeds_capacity() {
        let mut scheduler = AttentionScheduler::default();
        let identities: Vec<_> = (0..25)
            .map(|i| identity("cup", 0.8, BoundingBox::new(i as f64 * 0.03, 0.1, 0.05, 0.05)))
            .collect();

        let hot = ResourceState::nominal().with_thermal(ThermalState::Serious);
        let scheduled = scheduler.schedule(&identities, &hot);
        assert_eq!(scheduled.len(), scheduler.capacity(&hot));
    }

    #[test]
    fn test_low_confidence_identities_are_dropped() {
        let mut scheduler = AttentionScheduler::default();
        let scheduled = scheduler.schedule(
            &[identity("cup", 0.1, centered(0.2)), identity("cup", 0.9, centered(0.2))],
            &ResourceState::nominal(),
        );
        assert_eq!(scheduled.len(), 1);
    }

    #[test]
    fn test_ranking_prefers_large_centered_objects() {
        let mut scheduler = AttentionScheduler::default();
        let big = identity("person", 0.8, centered(0.5));
        let small = identity("person", 0.8, BoundingBox::new(0.9, 0.9, 0.05, 0.05));

        let scheduled = scheduler.schedule(&[small.clone(), big.clone()], &ResourceState::nominal());
        assert_eq!(scheduled[0].identity_id, big.id);
        assert!(scheduled[0].score.total > scheduled[1].score.total);
    }

    #[test]
    fn test_motion_factor() {
        let scheduler = AttentionScheduler::default();
        let mut moving = identity("dog", 0.8, centered(0.2));
        assert_eq!(scheduler.score(&moving).motion, 0.5);

        moving.last_displacement = Some(0.05);
        assert!((scheduler.score(&moving).motion - 0.5).abs() < 1e-9);

        moving.last_displacement = Some(0.5);
        assert_eq!(scheduler.score(&moving).motion, 1.0);

        moving.last_displacement = Some(0.0);
        assert_eq!(scheduler.score(&moving).motion, 0.0);
    }

    #[test]
    fn test_novelty_decays_with_frequency() {
        let mut scheduler = AttentionScheduler::default();
        let cup = identity("cup", 0.8, centered(0.2));

        scheduler.schedule(std::slice::from_ref(&cup), &ResourceState::nominal());
        assert_eq!(scheduler.score(&cup).novelty, 1.0);

        for _ in 0..9 {
            scheduler.schedule(std::slice::from_ref(&cup), &ResourceState::nominal());
        }
        let expected = 1.0 / (1.0 + 10f64.ln());
        assert!((scheduler.score(&cup).novelty - expected).abs() < 1e-9);
        assert_eq!(scheduler.label_frequency("cup"), 10);
    }
}
