//! Records handed to the long-term persistence sink.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BoundingBox, IdentityId};

/// Why the save engine decided to persist (or not persist) an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SaveReason {
    /// First record of this label in the window
    FirstOfClass,
    /// Confidence rose by more than the configured delta
    ConfidenceImproved,
    /// Box moved away from the best matching record
    SignificantMovement,
    /// Best match is older than the refresh window
    PeriodicRefresh,
    /// No record of this label at this confidence tier yet
    NewConfidenceTier,
    /// Visual signature could not be computed; saved conservatively
    SignatureUnavailable,
    /// Near-duplicate of a record inside the cooldown
    TooSimilarRecent,
    /// Nothing changed enough to be worth saving
    NotSignificant,
}

impl SaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::FirstOfClass => "first-of-class",
            SaveReason::ConfidenceImproved => "confidence-improved",
            SaveReason::SignificantMovement => "significant-movement",
            SaveReason::PeriodicRefresh => "periodic-refresh",
            SaveReason::NewConfidenceTier => "new-confidence-tier",
            SaveReason::SignatureUnavailable => "signature-unavailable",
            SaveReason::TooSimilarRecent => "too-similar-recent",
            SaveReason::NotSignificant => "not-significant",
        }
    }

    /// True for reasons that lead to a save.
    pub fn is_save(&self) -> bool {
        !matches!(self, SaveReason::TooSimilarRecent | SaveReason::NotSignificant)
    }
}

impl fmt::Display for SaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a saved observation, delivered to the persistence sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceRecord {
    /// Identity the observation belongs to
    pub identity_id: IdentityId,
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub class_index: i32,
    /// JPEG thumbnail of the region, base64 in JSON
    #[serde(default, skip_serializing_if = "Option::is_none", with = "thumbnail_base64")]
    #[schemars(with = "Option<String>")]
    pub thumbnail: Option<Vec<u8>>,
    /// Label from the known-object classifier, when recognized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized_as: Option<String>,
    pub reason: SaveReason,
    pub timestamp: DateTime<Utc>,
}

mod thumbnail_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(thumbnail: Option<Vec<u8>>) -> PersistenceRecord {
        PersistenceRecord {
            identity_id: IdentityId::new(),
            label: "cup".to_string(),
            confidence: 0.7,
            bounding_box: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            class_index: 41,
            thumbnail,
            recognized_as: None,
            reason: SaveReason::FirstOfClass,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_thumbnail_encodes_as_base64() {
        let json = serde_json::to_value(record(Some(vec![0xff, 0xd8, 0xff]))).unwrap();
        assert_eq!(json["thumbnail"], "/9j/");

        let back: PersistenceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.thumbnail, Some(vec![0xff, 0xd8, 0xff]));
    }

    #[test]
    fn test_missing_thumbnail_is_omitted() {
        let json = serde_json::to_value(record(None)).unwrap();
        assert!(json.get("thumbnail").is_none());
        assert_eq!(json["reason"], "first_of_class");
    }

    #[test]
    fn test_save_reason_classification() {
        assert!(SaveReason::FirstOfClass.is_save());
        assert!(SaveReason::SignatureUnavailable.is_save());
        assert!(!SaveReason::TooSimilarRecent.is_save());
        assert_eq!(SaveReason::FirstOfClass.to_string(), "first-of-class");
    }
}
