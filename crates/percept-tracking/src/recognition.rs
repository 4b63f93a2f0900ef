//! Known-object recognition.
//!
//! A few-shot k-nearest-neighbour classifier over visual signatures. Saved
//! observations teach it new samples; tracked identities are matched
//! against it to name objects that have been seen before.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RecognitionConfig;
use crate::error::{TrackingError, TrackingResult};
use crate::similarity::{cosine_similarity, l2_normalize};

/// Label reported when nothing is recognized.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Cosine distance to the nearest neighbour beyond which confidence is damped.
const FAR_NEIGHBOUR_DISTANCE: f64 = 0.5;

/// Result of a recognition query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    /// Predicted label, or `unknown`
    pub label: String,
    pub confidence: f64,
    /// Vote share per known label
    pub scores: BTreeMap<String, f64>,
    pub is_known: bool,
}

impl Recognition {
    fn unknown() -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            confidence: 0.0,
            scores: BTreeMap::new(),
            is_known: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sample {
    label: String,
    embedding: Vec<f32>,
}

/// On-disk classifier format.
#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    neighbors: usize,
    confidence_threshold: f64,
    max_samples_per_class: usize,
    samples: Vec<Sample>,
}

struct ClassifierInner {
    neighbors: usize,
    confidence_threshold: f64,
    max_samples_per_class: usize,
    /// Oldest first
    samples: Vec<Sample>,
}

impl ClassifierInner {
    /// Keep only the most recent samples of an over-full label.
    fn enforce_class_cap(&mut self, label: &str) {
        let count = self.samples.iter().filter(|s| s.label == label).count();
        if count <= self.max_samples_per_class {
            return;
        }

        let mut excess = count - self.max_samples_per_class;
        self.samples.retain(|s| {
            if excess > 0 && s.label == label {
                excess -= 1;
                false
            } else {
                true
            }
        });
        debug!(label, pruned = count - self.max_samples_per_class, "Pruned old samples");
    }
}

/// Thread-safe k-NN classifier over signatures.
pub struct KnnClassifier {
    inner: Mutex<ClassifierInner>,
}

impl KnnClassifier {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            inner: Mutex::new(ClassifierInner {
                neighbors: config.neighbors.max(1),
                confidence_threshold: config.confidence_threshold,
                max_samples_per_class: config.max_samples_per_class.max(1),
                samples: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClassifierInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a labelled sample. The embedding is L2-normalized on the way in.
    pub fn add_sample(&self, label: &str, embedding: &[f32]) -> TrackingResult<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(TrackingError::classifier("sample label is empty"));
        }
        if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
            return Err(TrackingError::classifier("sample embedding is empty or not finite"));
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.samples.first() {
            if existing.embedding.len() != embedding.len() {
                return Err(TrackingError::classifier(format!(
                    "embedding has {} dimensions, expected {}",
                    embedding.len(),
                    existing.embedding.len()
                )));
            }
        }

        let mut embedding = embedding.to_vec();
        l2_normalize(&mut embedding);
        inner.samples.push(Sample {
            label: label.to_string(),
            embedding,
        });
        inner.enforce_class_cap(label);

        debug!(label, total = inner.samples.len(), "Added recognition sample");
        Ok(())
    }

    /// Classify an embedding.
    ///
    /// The `k` nearest samples by cosine vote for their label, weighted by
    /// similarity. Confidence is the winning vote share, damped when even
    /// the nearest sample is far away.
    pub fn predict(&self, embedding: &[f32]) -> Recognition {
        let inner = self.lock();
        if inner.samples.is_empty() || embedding.is_empty() {
            return Recognition::unknown();
        }

        let mut neighbours: Vec<(&Sample, f64)> = inner
            .samples
            .iter()
            .map(|s| (s, cosine_similarity(embedding, &s.embedding)))
            .collect();
        neighbours.sort_by(|a, b| b.1.total_cmp(&a.1));
        neighbours.truncate(inner.neighbors.min(inner.samples.len()));

        let total: f64 = neighbours.iter().map(|(_, s)| *s).sum();
        let mut scores: BTreeMap<String, f64> = inner
            .samples
            .iter()
            .map(|s| (s.label.clone(), 0.0))
            .collect();
        if total > 0.0 {
            for (sample, similarity) in &neighbours {
                if let Some(score) = scores.get_mut(&sample.label) {
                    *score += similarity / total;
                }
            }
        }

        let Some((label, mut confidence)) = scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(l, s)| (l.clone(), *s))
        else {
            return Recognition::unknown();
        };

        let nearest_distance = 1.0 - neighbours.first().map_or(0.0, |(_, s)| *s);
        if nearest_distance > FAR_NEIGHBOUR_DISTANCE {
            confidence *= 1.0 - nearest_distance;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let is_known = confidence >= inner.confidence_threshold;
        Recognition {
            label: if is_known { label } else { UNKNOWN_LABEL.to_string() },
            confidence,
            scores,
            is_known,
        }
    }

    /// Labels with at least one sample, sorted.
    pub fn known_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.sample_counts().into_keys().collect();
        classes.sort();
        classes
    }

    pub fn sample_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for sample in &self.lock().samples {
            *counts.entry(sample.label.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_confidence_threshold(&self, threshold: f64) {
        self.lock().confidence_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.lock().confidence_threshold
    }

    /// Forget every sample.
    pub fn reset(&self) {
        self.lock().samples.clear();
        info!("Recognition classifier reset");
    }

    /// Write the classifier to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> TrackingResult<()> {
        let path = path.as_ref();
        let model = {
            let inner = self.lock();
            ModelFile {
                neighbors: inner.neighbors,
                confidence_threshold: inner.confidence_threshold,
                max_samples_per_class: inner.max_samples_per_class,
                samples: inner.samples.clone(),
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(&model)?)?;

        info!(path = %path.display(), samples = model.samples.len(), "Saved recognition model");
        Ok(())
    }

    /// Load a classifier previously written by [`KnnClassifier::save`].
    pub fn load(path: impl AsRef<Path>) -> TrackingResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TrackingError::ModelNotFound(path.to_path_buf()));
        }

        let model: ModelFile = serde_json::from_slice(&std::fs::read(path)?)?;
        if let Some(first) = model.samples.first() {
            let dim = first.embedding.len();
            if model.samples.iter().any(|s| s.embedding.len() != dim) {
                return Err(TrackingError::classifier("model samples have mixed dimensions"));
            }
        }

        info!(path = %path.display(), samples = model.samples.len(), "Loaded recognition model");
        Ok(Self {
            inner: Mutex::new(ClassifierInner {
                neighbors: model.neighbors.max(1),
                confidence_threshold: model.confidence_threshold.clamp(0.0, 1.0),
                max_samples_per_class: model.max_samples_per_class.max(1),
                samples: model.samples,
            }),
        })
    }

    /// Load from `path` if it exists, otherwise start empty.
    pub fn load_or_new(path: impl AsRef<Path>, config: &RecognitionConfig) -> TrackingResult<Self> {
        match Self::load(path) {
            Ok(classifier) => Ok(classifier),
            Err(TrackingError::ModelNotFound(_)) => Ok(Self::new(config)),
            Err(e) => Err(e),
        }
    }
}

impl Default for KnnClassifier {
    fn default() -> Self {
        Self::new(&RecognitionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained() -> KnnClassifier {
        let classifier = KnnClassifier::default();
        for _ in 0..3 {
            classifier.add_sample("mug", &[1.0, 0.1, 0.0]).unwrap();
            classifier.add_sample("keys", &[0.0, 0.1, 1.0]).unwrap();
        }
        classifier
    }

    #[test]
    fn test_empty_classifier_knows_nothing() {
        let classifier = KnnClassifier::default();
        let result = classifier.predict(&[1.0, 0.0]);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(!result.is_known);
        assert!(classifier.known_classes().is_empty());
    }

    #[test]
    fn test_recognizes_nearest_class() {
        let classifier = trained();
        let result = classifier.predict(&[0.9, 0.1, 0.05]);
        assert!(result.is_known);
        assert_eq!(result.label, "mug");
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(result.scores.get("keys"), Some(&0.0));
    }

    #[test]
    fn test_far_query_is_damped_to_unknown() {
        let classifier = trained();
        // Nearly orthogonal to both classes
        let result = classifier.predict(&[0.0, 1.0, 0.0]);
        assert!(!result.is_known);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(result.confidence < 0.6);
    }

    #[test]
    fn test_threshold_controls_known() {
        let classifier = trained();
        classifier.set_confidence_threshold(1.0);
        assert!(!classifier.predict(&[0.7, 0.1, 0.7]).is_known);
    }

    #[test]
    fn test_class_cap_keeps_most_recent() {
        let config = RecognitionConfig {
            max_samples_per_class: 2,
            ..Default::default()
        };
        let classifier = KnnClassifier::new(&config);
        classifier.add_sample("cup", &[1.0, 0.0]).unwrap();
        classifier.add_sample("cup", &[0.0, 1.0]).unwrap();
        classifier.add_sample("cup", &[1.0, 1.0]).unwrap();

        assert_eq!(classifier.sample_counts().get("cup"), Some(&2));
        // The oldest sample ([1, 0]) is gone
        let result = classifier.predict(&[1.0, 0.0]);
        assert!(result.confidence > 0.0);
        assert_eq!(classifier.len(), 2);
    }

    #[test]
    fn test_rejects_bad_samples() {
        let classifier = KnnClassifier::default();
        assert!(classifier.add_sample("", &[1.0]).is_err());
        assert!(classifier.add_sample("cup", &[]).is_err());
        assert!(classifier.add_sample("cup", &[f32::NAN]).is_err());

        classifier.add_sample("cup", &[1.0, 0.0]).unwrap();
        assert!(classifier.add_sample("cup", &[1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("known.json");

        let classifier = trained();
        classifier.set_confidence_threshold(0.7);
        classifier.save(&path).unwrap();

        let loaded = KnnClassifier::load(&path).unwrap();
        assert_eq!(loaded.known_classes(), vec!["keys".to_string(), "mug".to_string()]);
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.confidence_threshold(), 0.7);
        assert_eq!(loaded.predict(&[0.0, 0.1, 0.9]).label, "keys");
    }

    #[test]
    fn test_load_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        assert!(matches!(KnnClassifier::load(&path), Err(TrackingError::ModelNotFound(_))));
        let fresh = KnnClassifier::load_or_new(&path, &RecognitionConfig::default()).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_reset() {
        let classifier = trained();
        classifier.reset();
        assert!(classifier.is_empty());
    }
}
