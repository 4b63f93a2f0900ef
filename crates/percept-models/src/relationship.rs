//! Spatial relationships and coarse scene labels.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::IdentityId;

/// Spatial relation between two tracked identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Overlapping,
    Near,
    Inside,
    Above,
    Below,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Overlapping => "overlapping",
            RelationType::Near => "near",
            RelationType::Inside => "inside",
            RelationType::Above => "above",
            RelationType::Below => "below",
        }
    }

    /// The same relation seen from the other side of the pair.
    ///
    /// `Inside` has none; it always reads from the inner identity.
    pub fn inverse(&self) -> Option<RelationType> {
        match self {
            RelationType::Inside => None,
            RelationType::Above => Some(RelationType::Below),
            RelationType::Below => Some(RelationType::Above),
            symmetric => Some(*symmetric),
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relation between an unordered pair of identities.
///
/// The relation reads "`first` is `relation` `second`". The pair is
/// stored with `first < second`, except for `Inside`, where `first` is
/// always the inner identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub first: IdentityId,
    pub second: IdentityId,
    pub first_label: String,
    pub second_label: String,
    pub relation: RelationType,
    /// Strength of the relation (0.0-1.0)
    pub confidence: f64,
}

impl Relationship {
    /// Build a relationship with the pair put in canonical order.
    pub fn new(
        a: (IdentityId, &str),
        b: (IdentityId, &str),
        relation: RelationType,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let (first, second, relation) = match relation.inverse() {
            Some(inverse) if b.0 < a.0 => (b, a, inverse),
            _ => (a, b, relation),
        };
        Self {
            first: first.0,
            second: second.0,
            first_label: first.1.to_string(),
            second_label: second.1.to_string(),
            relation,
            confidence,
        }
    }

    /// True if the relationship involves the given identity.
    pub fn involves(&self, id: IdentityId) -> bool {
        self.first == id || self.second == id
    }
}

/// Coarse scene classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SceneType {
    Office,
    Kitchen,
    LivingRoom,
    Street,
    Outdoor,
    Dining,
    #[default]
    Unknown,
}

impl SceneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SceneType::Office => "office",
            SceneType::Kitchen => "kitchen",
            SceneType::LivingRoom => "living_room",
            SceneType::Street => "street",
            SceneType::Outdoor => "outdoor",
            SceneType::Dining => "dining",
            SceneType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SceneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse activity inferred from a person's relations to objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Working,
    Eating,
    Reading,
    UsingPhone,
    WatchingTv,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Working => "working",
            Activity::Eating => "eating",
            Activity::Reading => "reading",
            Activity::UsingPhone => "using_phone",
            Activity::WatchingTv => "watching_tv",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
