//! Builder that wires collaborators into a [`FramePipeline`].
//!
//! Every collaborator is optional. Missing ones fall back to:
//! - `NoopExtractor` (no signatures, geometric dedup)
//! - `NominalResourceMonitor` (full attention capacity)
//! - a fresh classifier, loaded from `recognition.model_path` when set

use std::sync::Arc;

use tracing::info;

use crate::config::TrackingConfig;
use crate::error::TrackingResult;
use crate::pipeline::FramePipeline;
use crate::providers::{FeatureExtractor, NominalResourceMonitor, NoopExtractor, ResourceMonitor};
use crate::recognition::KnnClassifier;

/// Builder for a [`FramePipeline`].
///
/// # Example
///
/// ```ignore
/// let mut pipeline = PipelineBuilder::new(TrackingConfig::from_env())
///     .extractor(Arc::new(ColorHistogramExtractor::default()))
///     .build()?;
/// let report = pipeline.process(frame).await;
/// ```
pub struct PipelineBuilder {
    config: TrackingConfig,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    classifier: Option<Arc<KnnClassifier>>,
}

impl PipelineBuilder {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            extractor: None,
            monitor: None,
            classifier: None,
        }
    }

    pub fn extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn resource_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Use an existing classifier instead of creating one.
    pub fn classifier(mut self, classifier: Arc<KnnClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> TrackingResult<FramePipeline> {
        self.config.validate()?;

        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(NoopExtractor));
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(NominalResourceMonitor));

        let recognition = &self.config.recognition;
        let classifier = match (recognition.enabled, self.classifier) {
            (false, _) => None,
            (true, Some(classifier)) => Some(classifier),
            (true, None) => Some(Arc::new(match &recognition.model_path {
                Some(path) => KnnClassifier::load_or_new(path, recognition)?,
                None => KnnClassifier::new(recognition),
            })),
        };

        info!(
            extractor = extractor.name(),
            extractor_available = extractor.is_available(),
            resource_monitor = monitor.name(),
            recognition = classifier.is_some(),
            "Building frame pipeline"
        );

        Ok(FramePipeline::from_parts(self.config, extractor, monitor, classifier))
    }
}
