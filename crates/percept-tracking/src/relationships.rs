//! Spatial relationships and scene inference.
//!
//! Every pair of tracked identities is classified by overlap, containment,
//! proximity and vertical ordering. Label pairs seen together are counted
//! over time and feed a fixed rule table that guesses the scene type.

use std::collections::{BTreeSet, HashMap};

use percept_models::{Activity, BoundingBox, RelationType, Relationship, SceneType};
use serde::Serialize;
use tracing::debug;

use crate::config::RelationshipConfig;
use crate::identity::TrackedIdentity;

/// Rule contributing to a scene score when enough of its labels are present.
struct SceneRule {
    scene: SceneType,
    labels: &'static [&'static str],
    min_present: usize,
    /// Score added per present label
    increment: f64,
}

const SCENE_RULES: &[SceneRule] = &[
    SceneRule {
        scene: SceneType::Office,
        labels: &["person", "laptop", "keyboard", "mouse", "tv", "chair", "book"],
        min_present: 2,
        increment: 0.25,
    },
    SceneRule {
        scene: SceneType::Kitchen,
        labels: &["refrigerator", "oven", "microwave", "sink", "toaster", "bottle", "knife"],
        min_present: 2,
        increment: 0.25,
    },
    SceneRule {
        scene: SceneType::LivingRoom,
        labels: &["couch", "tv", "remote", "potted plant", "chair", "vase"],
        min_present: 2,
        increment: 0.25,
    },
    SceneRule {
        scene: SceneType::Street,
        labels: &["car", "truck", "bus", "traffic light", "stop sign", "motorcycle", "bicycle"],
        min_present: 2,
        increment: 0.3,
    },
    SceneRule {
        scene: SceneType::Outdoor,
        labels: &["bench", "bird", "kite", "umbrella", "dog", "frisbee"],
        min_present: 2,
        increment: 0.2,
    },
    SceneRule {
        scene: SceneType::Dining,
        labels: &["dining table", "cup", "fork", "spoon", "bowl", "wine glass", "pizza", "sandwich"],
        min_present: 2,
        increment: 0.2,
    },
];

/// Objects whose closeness to a person suggests an activity.
const ACTIVITY_RULES: &[(&str, Activity)] = &[
    ("laptop", Activity::Working),
    ("keyboard", Activity::Working),
    ("cup", Activity::Eating),
    ("bowl", Activity::Eating),
    ("fork", Activity::Eating),
    ("spoon", Activity::Eating),
    ("sandwich", Activity::Eating),
    ("pizza", Activity::Eating),
    ("book", Activity::Reading),
    ("cell phone", Activity::UsingPhone),
    ("tv", Activity::WatchingTv),
    ("remote", Activity::WatchingTv),
];

/// Result of analyzing one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SceneAnalysis {
    pub relationships: Vec<Relationship>,
    pub scene: SceneType,
    pub scene_confidence: f64,
    pub activities: Vec<Activity>,
}

/// Pairwise relationship and scene analyzer.
pub struct RelationshipAnalyzer {
    config: RelationshipConfig,
    /// Frames in which each unordered label pair appeared together
    co_occurrence: HashMap<(String, String), u64>,
}

impl RelationshipAnalyzer {
    pub fn new(config: RelationshipConfig) -> Self {
        Self {
            config,
            co_occurrence: HashMap::new(),
        }
    }

    /// Classify how box `a` relates to box `b`.
    ///
    /// `Inside` reads "`a` is inside `b`" and needs `a` to be clearly
    /// smaller than its container; similar-sized boxes on top of each
    /// other are overlapping. Pass the smaller box first to detect
    /// containment in either direction.
    pub fn classify(&self, a: &BoundingBox, b: &BoundingBox) -> Option<(RelationType, f64)> {
        let c = &self.config;
        if !a.is_valid() || !b.is_valid() {
            return None;
        }

        let size_ratio = a.size_ratio(b);
        if b.contains(a) && size_ratio < c.inside_max_size_ratio {
            return Some((RelationType::Inside, 1.0 - 0.5 * size_ratio));
        }

        let overlap = a.overlap_ratio(b);
        if overlap > c.overlap_threshold {
            return Some((RelationType::Overlapping, overlap));
        }

        let distance = a.center_distance(b);
        if distance < c.near_distance {
            return Some((RelationType::Near, 1.0 - distance / c.near_distance));
        }

        let narrower = a.width.min(b.width);
        let shared = if narrower > 0.0 {
            a.horizontal_overlap(b) / narrower
        } else {
            0.0
        };
        if shared >= c.min_horizontal_overlap {
            let (relation, gap) = if a.cy() < b.cy() {
                (RelationType::Above, b.y - a.y2())
            } else {
                (RelationType::Below, a.y - b.y2())
            };
            if gap <= c.vertical_gap {
                let closeness = 1.0 - gap.max(0.0) / c.vertical_gap.max(f64::EPSILON);
                return Some((relation, (shared.min(1.0) * closeness).clamp(0.0, 1.0)));
            }
        }

        None
    }

    /// Analyze the identities tracked in the current frame.
    pub fn analyze(&mut self, identities: &[TrackedIdentity]) -> SceneAnalysis {
        let mut relationships = Vec::new();
        for (i, a) in identities.iter().enumerate() {
            for b in &identities[i + 1..] {
                if a.id == b.id {
                    continue;
                }
                let (a, b) = if b.bounding_box.area() < a.bounding_box.area() {
                    (b, a)
                } else {
                    (a, b)
                };
                if let Some((relation, confidence)) = self.classify(&a.bounding_box, &b.bounding_box) {
                    relationships.push(Relationship::new(
                        (a.id, a.label.as_str()),
                        (b.id, b.label.as_str()),
                        relation,
                        confidence,
                    ));
                }
            }
        }

        let labels: BTreeSet<&str> = identities.iter().map(|i| i.label.as_str()).collect();
        self.record_co_occurrence(&labels);

        let (scene, scene_confidence) = self.infer_scene(&labels);
        let activities = infer_activities(&relationships);

        debug!(
            identities = identities.len(),
            relationships = relationships.len(),
            scene = %scene,
            scene_confidence,
            "Scene analyzed"
        );

        SceneAnalysis {
            relationships,
            scene,
            scene_confidence,
            activities,
        }
    }

    fn record_co_occurrence(&mut self, labels: &BTreeSet<&str>) {
        let labels: Vec<&str> = labels.iter().copied().collect();
        for (i, a) in labels.iter().enumerate() {
            for b in &labels[i + 1..] {
                *self
                    .co_occurrence
                    .entry((a.to_string(), b.to_string()))
                    .or_insert(0) += 1;
            }
        }
    }

    /// Frames in which two labels appeared together.
    pub fn co_occurrence(&self, a: &str, b: &str) -> u64 {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.co_occurrence.get(&key).copied().unwrap_or(0)
    }

    /// Score every scene rule against the present labels; highest wins.
    pub fn infer_scene(&self, labels: &BTreeSet<&str>) -> (SceneType, f64) {
        let mut best = (SceneType::Unknown, 0.0);

        for rule in SCENE_RULES {
            let present: Vec<&str> = rule
                .labels
                .iter()
                .copied()
                .filter(|l| labels.contains(l))
                .collect();
            if present.len() < rule.min_present {
                continue;
            }

            let mut history = 0u64;
            for (i, a) in present.iter().enumerate() {
                for b in &present[i + 1..] {
                    history += self.co_occurrence(a, b);
                }
            }

            let score = (rule.increment * present.len() as f64
                + self.config.history_weight * (1.0 + history as f64).ln())
            .min(1.0);

            if score > best.1 {
                best = (rule.scene, score);
            }
        }

        best
    }
}

impl Default for RelationshipAnalyzer {
    fn default() -> Self {
        Self::new(RelationshipConfig::default())
    }
}

/// Activities suggested by a person being close to a telling object.
fn infer_activities(relationships: &[Relationship]) -> Vec<Activity> {
    let mut activities = Vec::new();

    for rel in relationships {
        let object = if rel.first_label == "person" {
            rel.second_label.as_str()
        } else if rel.second_label == "person" {
            rel.first_label.as_str()
        } else {
            continue;
        };

        if matches!(rel.relation, RelationType::Above | RelationType::Below) {
            continue;
        }

        if let Some((_, activity)) = ACTIVITY_RULES.iter().find(|(label, _)| *label == object) {
            if !activities.contains(activity) {
                activities.push(*activity);
            }
        }
    }

    activities
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use percept_models::IdentityId;

    fn identity(label: &str, bbox: BoundingBox) -> TrackedIdentity {
        TrackedIdentity {
            id: IdentityId::new(),
            label: label.to_string(),
            class_index: 0,
            bounding_box: bbox,
            confidence: 0.8,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            observations: 1,
            signature: None,
            motion: None,
            last_displacement: None,
            recognized_as: None,
        }
    }

    #[test]
    fn test_overlapping_pair() {
        let mut analyzer = RelationshipAnalyzer::default();
        let person = identity("person", BoundingBox::new(0.2, 0.2, 0.3, 0.5));
        let laptop = identity("laptop", BoundingBox::new(0.4, 0.5, 0.3, 0.2));

        let analysis = analyzer.analyze(&[person.clone(), laptop.clone()]);
        assert_eq!(analysis.relationships.len(), 1);
        let rel = &analysis.relationships[0];
        assert_eq!(rel.relation, RelationType::Overlapping);
        assert!(rel.involves(person.id) && rel.involves(laptop.id));

        // Same box for both labels
        let same = BoundingBox::new(0.3, 0.3, 0.3, 0.3);
        let analysis = analyzer.analyze(&[identity("person", same), identity("laptop", same)]);
        assert_eq!(analysis.relationships.len(), 1);
        assert_eq!(analysis.relationships[0].relation, RelationType::Overlapping);
    }

    #[test]
    fn test_small_box_inside_container() {
        let analyzer = RelationshipAnalyzer::default();
        let table = BoundingBox::new(0.1, 0.5, 0.6, 0.3);
        let cup = BoundingBox::new(0.3, 0.55, 0.05, 0.08);

        assert_eq!(analyzer.classify(&cup, &table).map(|r| r.0), Some(RelationType::Inside));
        assert_eq!(analyzer.classify(&table, &cup).map(|r| r.0), Some(RelationType::Overlapping));
    }

    #[test]
    fn test_inside_names_inner_identity_first() {
        let mut analyzer = RelationshipAnalyzer::default();
        let table = identity("dining table", BoundingBox::new(0.1, 0.5, 0.6, 0.3));
        let cup = identity("cup", BoundingBox::new(0.3, 0.55, 0.05, 0.08));

        for frame in [[table.clone(), cup.clone()], [cup.clone(), table.clone()]] {
            let analysis = analyzer.analyze(&frame);
            let rel = &analysis.relationships[0];
            assert_eq!(rel.relation, RelationType::Inside);
            assert_eq!(rel.first, cup.id);
            assert_eq!(rel.second_label, "dining table");
        }
    }

    #[test]
    fn test_similar_sized_nested_boxes_overlap() {
        let analyzer = RelationshipAnalyzer::default();
        let outer = BoundingBox::new(0.2, 0.2, 0.4, 0.4);
        let inner = BoundingBox::new(0.22, 0.22, 0.36, 0.36);

        assert_eq!(analyzer.classify(&inner, &outer).map(|r| r.0), Some(RelationType::Overlapping));
    }

    #[test]
    fn test_near_pair() {
        let analyzer = RelationshipAnalyzer::default();
        let a = BoundingBox::from_center(0.50, 0.5, 0.04, 0.04);
        let b = BoundingBox::from_center(0.56, 0.5, 0.04, 0.04);
        let (relation, confidence) = analyzer.classify(&a, &b).unwrap();
        assert_eq!(relation, RelationType::Near);
        assert!((confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_vertical_ordering() {
        let analyzer = RelationshipAnalyzer::default();
        let lamp = BoundingBox::new(0.40, 0.10, 0.20, 0.20);
        let desk = BoundingBox::new(0.35, 0.35, 0.30, 0.20);

        assert_eq!(analyzer.classify(&lamp, &desk).map(|r| r.0), Some(RelationType::Above));
        assert_eq!(analyzer.classify(&desk, &lamp).map(|r| r.0), Some(RelationType::Below));
    }

    #[test]
    fn test_distant_pair_is_discarded() {
        let mut analyzer = RelationshipAnalyzer::default();
        let analysis = analyzer.analyze(&[
            identity("car", BoundingBox::new(0.0, 0.0, 0.1, 0.1)),
            identity("dog", BoundingBox::new(0.8, 0.8, 0.1, 0.1)),
        ]);
        assert!(analysis.relationships.is_empty());
    }

    #[test]
    fn test_office_scene_and_working_activity() {
        let mut analyzer = RelationshipAnalyzer::default();
        let analysis = analyzer.analyze(&[
            identity("person", BoundingBox::new(0.2, 0.2, 0.3, 0.5)),
            identity("laptop", BoundingBox::new(0.4, 0.5, 0.3, 0.2)),
        ]);

        assert_eq!(analysis.scene, SceneType::Office);
        assert!(analysis.scene_confidence >= 0.5);
        assert_eq!(analysis.activities, vec![Activity::Working]);
    }

    #[test]
    fn test_unknown_scene_by_default() {
        let mut analyzer = RelationshipAnalyzer::default();
        let analysis = analyzer.analyze(&[identity("giraffe", BoundingBox::new(0.1, 0.1, 0.2, 0.2))]);
        assert_eq!(analysis.scene, SceneType::Unknown);
        assert_eq!(analysis.scene_confidence, 0.0);
    }

    #[test]
    fn test_co_occurrence_accumulates() {
        let mut analyzer = RelationshipAnalyzer::default();
        let frame = [
            identity("car", BoundingBox::new(0.0, 0.0, 0.1, 0.1)),
            identity("bus", BoundingBox::new(0.5, 0.5, 0.2, 0.2)),
        ];

        let first = analyzer.analyze(&frame);
        for _ in 0..9 {
            analyzer.analyze(&frame);
        }
        let later = analyzer.analyze(&frame);

        assert_eq!(analyzer.co_occurrence("bus", "car"), 11);
        assert_eq!(analyzer.co_occurrence("car", "bus"), 11);
        assert_eq!(later.scene, SceneType::Street);
        assert!(later.scene_confidence > first.scene_confidence);
    }
}
