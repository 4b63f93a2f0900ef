//! Raw detector output.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::BoundingBox;

/// A single object detection from one frame. Carries no identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Class label reported by the detector
    pub label: String,
    /// Detector confidence (0.0-1.0)
    pub confidence: f64,
    /// Normalized box, origin top-left
    pub bounding_box: BoundingBox,
    /// Detector class index
    #[serde(default)]
    pub class_index: i32,
}

impl Detection {
    /// Create a new detection.
    pub fn new(
        label: impl Into<String>,
        confidence: f64,
        bounding_box: BoundingBox,
        class_index: i32,
    ) -> Self {
        Self {
            label: label.into(),
            confidence,
            bounding_box,
            class_index,
        }
    }

    /// Return a copy fit for tracking, or `None` if the detection is unusable.
    ///
    /// Confidence is clamped to `[0, 1]` and the box is clipped to the frame.
    /// Empty labels, non-finite confidences and boxes with no area inside
    /// the frame are rejected.
    pub fn sanitized(&self) -> Option<Detection> {
        let label = self.label.trim();
        if label.is_empty() || !self.confidence.is_finite() {
            return None;
        }

        let bounding_box = self.bounding_box.clamp_to_frame()?;

        Some(Detection {
            label: label.to_string(),
            confidence: self.confidence.clamp(0.0, 1.0),
            bounding_box,
            class_index: self.class_index,
        })
    }
}

/// All detections for one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetectionFrame {
    /// Capture time of the frame
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Detections in no particular order
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionFrame {
    /// Create a frame stamped with the given time.
    pub fn new(timestamp: DateTime<Utc>, detections: Vec<Detection>) -> Self {
        Self {
            timestamp,
            detections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_confidence_and_box() {
        let det = Detection::new(" person ", 1.4, BoundingBox::new(-0.1, 0.5, 0.3, 0.2), 0);
        let clean = det.sanitized().unwrap();

        assert_eq!(clean.label, "person");
        assert_eq!(clean.confidence, 1.0);
        assert_eq!(clean.bounding_box.x, 0.0);
        assert!((clean.bounding_box.width - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_sanitize_rejects_unusable_detections() {
        let empty_label = Detection::new("", 0.9, BoundingBox::new(0.1, 0.1, 0.1, 0.1), 0);
        let nan_conf = Detection::new("cup", f64::NAN, BoundingBox::new(0.1, 0.1, 0.1, 0.1), 0);
        let no_area = Detection::new("cup", 0.9, BoundingBox::new(0.1, 0.1, 0.0, 0.1), 0);

        assert!(empty_label.sanitized().is_none());
        assert!(nan_conf.sanitized().is_none());
        assert!(no_area.sanitized().is_none());
    }

    #[test]
    fn test_detection_wire_format() {
        let json = r#"{
            "label": "laptop",
            "confidence": 0.8,
            "boundingBox": {"x": 0.1, "y": 0.2, "w": 0.3, "h": 0.4},
            "classIndex": 63
        }"#;
        let det: Detection = serde_json::from_str(json).unwrap();

        assert_eq!(det.label, "laptop");
        assert_eq!(det.class_index, 63);
        assert!((det.bounding_box.height - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_frame_defaults() {
        let frame: DetectionFrame = serde_json::from_str("{}").unwrap();
        assert!(frame.detections.is_empty());
    }
}
