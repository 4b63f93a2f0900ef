//! Per-frame tracking pipeline.
//!
//! One call to [`FramePipeline::process`] runs a full cycle:
//!
//! 1. Poll resources and stabilize the raw detections
//! 2. Extract signatures for unbound tracks and resolve identities
//! 3. Schedule the most interesting identities under the current capacity
//! 4. Extract signatures for scheduled identities, concurrently
//! 5. Write identities back to the cache
//! 6. Decide saves and queue records for the persistence sink
//! 7. Analyze relationships and the scene
//!
//! Nothing in a cycle is fatal; degraded collaborators fall back to
//! geometric comparisons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use image::RgbImage;
use percept_models::{BoundingBox, Detection, DetectionFrame, IdentityId, PersistenceRecord, ResourceState};
use tracing::{debug, warn};

use crate::attention::{AttentionScheduler, ScheduledIdentity};
use crate::cache::ShortTermCache;
use crate::clock::FrameClock;
use crate::config::TrackingConfig;
use crate::error::TrackingResult;
use crate::identity::{IdentityResolver, MatchKind, ResolvedTrack};
use crate::metrics;
use crate::outbox::PersistenceOutbox;
use crate::providers::{FeatureExtractor, ResourceMonitor};
use crate::recognition::KnnClassifier;
use crate::relationships::{RelationshipAnalyzer, SceneAnalysis};
use crate::save_decision::{Observation, SaveDecision, SaveDecisionEngine, SignatureStatus};
use crate::stabilizer::{StabilizedTrack, Stabilizer};
use crate::thumbnail::encode_thumbnail;

/// One video frame handed to the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame number assigned by the producer
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
    /// Pixels, when the producer has them; needed for signatures and thumbnails
    pub image: Option<Arc<RgbImage>>,
}

impl Frame {
    pub fn new(index: u64, timestamp: DateTime<Utc>, detections: Vec<Detection>) -> Self {
        Self {
            index,
            timestamp,
            detections,
            image: None,
        }
    }

    pub fn from_detections(index: u64, frame: DetectionFrame) -> Self {
        Self::new(index, frame.timestamp, frame.detections)
    }

    pub fn with_image(mut self, image: Arc<RgbImage>) -> Self {
        self.image = Some(image);
        self
    }
}

/// Save decision taken for one scheduled identity.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub identity_id: IdentityId,
    pub label: String,
    pub decision: SaveDecision,
}

/// Everything a frame cycle produced.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub resources: ResourceState,
    /// Attention capacity under `resources`
    pub capacity: usize,
    /// Confirmed stabilizer output
    pub tracks: Vec<StabilizedTrack>,
    /// One identity per confirmed track, after write-back
    pub identities: Vec<ResolvedTrack>,
    pub scheduled: Vec<ScheduledIdentity>,
    pub decisions: Vec<SaveOutcome>,
    /// Records queued for persistence this frame
    pub records: Vec<PersistenceRecord>,
    /// Identities pushed out of the cache by capacity
    pub evicted: Vec<IdentityId>,
    pub extraction_failures: usize,
    pub analysis: Option<SceneAnalysis>,
    pub duration: Duration,
}

impl FrameReport {
    /// Identities minted this frame.
    pub fn minted(&self) -> usize {
        self.identities
            .iter()
            .filter(|r| r.kind == MatchKind::Minted)
            .count()
    }

    pub fn saved(&self) -> usize {
        self.records.len()
    }
}

/// Extract signatures for a set of regions with bounded concurrency.
async fn extract_regions<K: Send + 'static>(
    extractor: &Arc<dyn FeatureExtractor>,
    image: &Arc<RgbImage>,
    regions: Vec<(K, BoundingBox)>,
    limit: usize,
) -> Vec<(K, TrackingResult<Vec<f32>>)> {
    stream::iter(regions)
        .map(|(key, region)| {
            let extractor = Arc::clone(extractor);
            let image = Arc::clone(image);
            async move { (key, extractor.extract(image, region).await) }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

/// The stateful tracking pipeline.
///
/// The cache, save engine, outbox, classifier and clock are shared with
/// the maintenance cycle; everything else is owned by the frame loop.
pub struct FramePipeline {
    config: TrackingConfig,
    stabilizer: Stabilizer,
    resolver: IdentityResolver,
    scheduler: AttentionScheduler,
    relationships: RelationshipAnalyzer,
    cache: Arc<ShortTermCache>,
    saves: Arc<SaveDecisionEngine>,
    outbox: Arc<PersistenceOutbox>,
    classifier: Option<Arc<KnnClassifier>>,
    extractor: Arc<dyn FeatureExtractor>,
    monitor: Arc<dyn ResourceMonitor>,
    clock: Arc<FrameClock>,
    frames_processed: u64,
}

impl FramePipeline {
    pub(crate) fn from_parts(
        config: TrackingConfig,
        extractor: Arc<dyn FeatureExtractor>,
        monitor: Arc<dyn ResourceMonitor>,
        classifier: Option<Arc<KnnClassifier>>,
    ) -> Self {
        Self {
            stabilizer: Stabilizer::with_config(config.stabilizer.clone()),
            resolver: IdentityResolver::new(config.identity.clone()),
            scheduler: AttentionScheduler::new(config.attention.clone()),
            relationships: RelationshipAnalyzer::new(config.relationships.clone()),
            cache: Arc::new(ShortTermCache::new(&config.cache)),
            saves: Arc::new(SaveDecisionEngine::new(config.save.clone())),
            outbox: Arc::new(PersistenceOutbox::new(config.maintenance.outbox_capacity)),
            classifier,
            extractor,
            monitor,
            clock: Arc::new(FrameClock::new()),
            frames_processed: 0,
            config,
        }
    }

    /// Run one frame cycle.
    pub async fn process(&mut self, frame: Frame) -> FrameReport {
        let started = Instant::now();
        let now = frame.timestamp;
        self.clock.observe(now);
        let resources = self.monitor.current();
        let capacity = self.scheduler.capacity(&resources);

        // Stabilize
        let tracks = self.stabilizer.update(&frame.detections);
        self.resolver.retain_tracks(&self.stabilizer.live_track_ids());

        // Signatures are only possible with both an extractor and pixels
        let image = frame
            .image
            .clone()
            .filter(|_| self.extractor.is_available());
        let mut extraction_failures = 0;

        // Signatures for tracks with no identity yet, for appearance re-id
        let known = self.cache.snapshot();
        let mut queries: HashMap<u64, Vec<f32>> = HashMap::new();
        if let Some(image) = &image {
            let regions: Vec<(u64, BoundingBox)> = self
                .resolver
                .unbound(&tracks, &known)
                .into_iter()
                .map(|t| (t.id, t.bounding_box))
                .collect();
            for (track_id, result) in extract_regions(&self.extractor, image, regions, capacity).await {
                match result {
                    Ok(signature) => {
                        queries.insert(track_id, signature);
                    }
                    Err(e) => {
                        extraction_failures += 1;
                        metrics::record_extraction_failure();
                        debug!(track_id, error = %e, "Re-id extraction failed");
                    }
                }
            }
        }

        // Resolve and schedule
        let mut resolved = self.resolver.resolve(&tracks, &known, &queries, now);
        let snapshot: Vec<_> = resolved.iter().map(|r| r.identity.clone()).collect();
        let scheduled = self.scheduler.schedule(&snapshot, &resources);

        let slot_of: HashMap<IdentityId, usize> = resolved
            .iter()
            .enumerate()
            .map(|(slot, r)| (r.identity.id, slot))
            .collect();
        let track_of: HashMap<u64, &StabilizedTrack> = tracks.iter().map(|t| (t.id, t)).collect();

        // Signatures for scheduled identities not queried this frame
        let mut status: HashMap<IdentityId, SignatureStatus> = HashMap::new();
        if let Some(image) = &image {
            let mut regions = Vec::new();
            for item in &scheduled {
                let Some(&slot) = slot_of.get(&item.identity_id) else {
                    continue;
                };
                let entry = &resolved[slot];
                if queries.contains_key(&entry.track_id) {
                    status.insert(item.identity_id, SignatureStatus::Available);
                } else {
                    regions.push((item.identity_id, entry.identity.bounding_box));
                }
            }

            for (identity_id, result) in extract_regions(&self.extractor, image, regions, capacity).await {
                let Some(&slot) = slot_of.get(&identity_id) else {
                    continue;
                };
                match result {
                    Ok(signature) => {
                        resolved[slot].identity.signature = Some(signature);
                        status.insert(identity_id, SignatureStatus::Available);
                    }
                    Err(e) => {
                        extraction_failures += 1;
                        metrics::record_extraction_failure();
                        warn!(identity_id = %identity_id, error = %e, "Signature extraction failed");
                        status.insert(identity_id, SignatureStatus::Failed);
                    }
                }
            }
        }

        // Name known objects from fresh signatures
        if let Some(classifier) = self.classifier.as_ref().filter(|c| !c.is_empty()) {
            for entry in resolved.iter_mut() {
                let fresh = queries.contains_key(&entry.track_id)
                    || status.get(&entry.identity.id) == Some(&SignatureStatus::Available);
                let Some(signature) = entry.identity.signature.as_deref().filter(|_| fresh) else {
                    continue;
                };
                let recognition = classifier.predict(signature);
                if recognition.is_known {
                    entry.identity.recognized_as = Some(recognition.label);
                }
            }
        }

        // Write back
        let mut evicted = Vec::new();
        for entry in &resolved {
            if let Some(old) = self.cache.set(entry.identity.id, entry.identity.clone()) {
                evicted.push(old.id);
            }
        }

        // Save decisions, best-scored first
        let mut decisions = Vec::with_capacity(scheduled.len());
        let mut records = Vec::new();
        for item in &scheduled {
            let Some(&slot) = slot_of.get(&item.identity_id) else {
                continue;
            };
            let entry = &resolved[slot];
            let identity = &entry.identity;
            let signature_status = status.get(&identity.id).copied().unwrap_or(SignatureStatus::NotConfigured);
            let signature = identity
                .signature
                .as_deref()
                .filter(|_| signature_status == SignatureStatus::Available);

            // Judge the current observation, not the identity's history
            let confidence = track_of
                .get(&entry.track_id)
                .map_or(identity.confidence, |t| t.confidence);

            let observation = Observation {
                identity_id: identity.id,
                label: &identity.label,
                confidence,
                bounding_box: identity.bounding_box,
                signature,
                signature_status,
            };
            let decision = self.saves.decide(&observation, now);

            if decision.save {
                let thumbnail = frame.image.as_deref().and_then(|img| {
                    encode_thumbnail(img, &identity.bounding_box)
                        .map_err(|e| warn!(identity_id = %identity.id, error = %e, "Thumbnail encoding failed"))
                        .ok()
                });
                let record = PersistenceRecord {
                    identity_id: identity.id,
                    label: identity.label.clone(),
                    confidence,
                    bounding_box: identity.bounding_box,
                    class_index: identity.class_index,
                    thumbnail,
                    recognized_as: identity.recognized_as.clone(),
                    reason: decision.reason,
                    timestamp: now,
                };
                self.outbox.push(record.clone());
                records.push(record);

                if let (Some(classifier), Some(signature)) = (&self.classifier, signature) {
                    if let Err(e) = classifier.add_sample(&identity.label, signature) {
                        warn!(label = %identity.label, error = %e, "Failed to add classifier sample");
                    }
                }
            }

            decisions.push(SaveOutcome {
                identity_id: identity.id,
                label: identity.label.clone(),
                decision,
            });
        }

        // Relationships
        let analysis = self.config.relationships.enabled.then(|| {
            let identities: Vec<_> = resolved.iter().map(|r| r.identity.clone()).collect();
            self.relationships.analyze(&identities)
        });

        self.frames_processed += 1;
        let duration = started.elapsed();
        let minted = resolved.iter().filter(|r| r.kind == MatchKind::Minted).count();
        metrics::record_frame(duration.as_secs_f64());
        metrics::record_identities_minted(minted as u64);
        metrics::set_attention_capacity(capacity);
        metrics::set_cache_size(self.cache.len());

        debug!(
            frame = frame.index,
            detections = frame.detections.len(),
            tracks = tracks.len(),
            identities = resolved.len(),
            scheduled = scheduled.len(),
            saved = records.len(),
            capacity,
            elapsed_ms = duration.as_millis() as u64,
            "Frame processed"
        );

        FrameReport {
            index: frame.index,
            timestamp: now,
            resources,
            capacity,
            tracks,
            identities: resolved,
            scheduled,
            decisions,
            records,
            evicted,
            extraction_failures,
            analysis,
            duration,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ShortTermCache> {
        &self.cache
    }

    pub fn save_engine(&self) -> &Arc<SaveDecisionEngine> {
        &self.saves
    }

    pub fn outbox(&self) -> &Arc<PersistenceOutbox> {
        &self.outbox
    }

    /// Time as seen by this pipeline's frames.
    pub fn clock(&self) -> &Arc<FrameClock> {
        &self.clock
    }

    pub fn classifier(&self) -> Option<&Arc<KnnClassifier>> {
        self.classifier.as_ref()
    }

    pub fn stabilizer(&self) -> &Stabilizer {
        &self.stabilizer
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn scheduler(&self) -> &AttentionScheduler {
        &self.scheduler
    }

    pub fn relationships(&self) -> &RelationshipAnalyzer {
        &self.relationships
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_builder::PipelineBuilder;
    use crate::providers::{ColorHistogramExtractor, SharedResourceMonitor};
    use chrono::Duration as ChronoDuration;
    use image::Rgb;
    use percept_models::{SaveReason, ThermalState};

    fn person(confidence: f64) -> Detection {
        Detection::new("person", confidence, BoundingBox::new(0.4, 0.3, 0.2, 0.4), 0)
    }

    fn frame(index: u64, start: DateTime<Utc>, detections: Vec<Detection>) -> Frame {
        Frame::new(index, start + ChronoDuration::milliseconds(100 * index as i64), detections)
    }

    #[tokio::test]
    async fn test_confirmation_needs_two_frames() {
        let mut pipeline = PipelineBuilder::new(TrackingConfig::default()).build().unwrap();
        let start = Utc::now();

        let first = pipeline.process(frame(0, start, vec![person(0.6)])).await;
        assert!(first.tracks.is_empty());
        assert!(first.identities.is_empty());

        let second = pipeline.process(frame(1, start, vec![person(0.6)])).await;
        assert_eq!(second.tracks.len(), 1);
        assert_eq!(second.minted(), 1);
        assert_eq!(second.saved(), 1);
        assert_eq!(pipeline.cache().len(), 1);
        assert_eq!(pipeline.outbox().len(), 1);
        assert_eq!(pipeline.frames_processed(), 2);
    }

    #[tokio::test]
    async fn test_capacity_follows_resources() {
        let monitor = SharedResourceMonitor::default();
        let mut pipeline = PipelineBuilder::new(TrackingConfig::default())
            .resource_monitor(Arc::new(monitor.clone()))
            .build()
            .unwrap();
        let start = Utc::now();

        let nominal = pipeline.process(frame(0, start, vec![])).await;
        monitor.set(ResourceState::nominal().with_thermal(ThermalState::Critical));
        let hot = pipeline.process(frame(1, start, vec![])).await;

        assert_eq!(nominal.capacity, 10);
        assert!(hot.capacity < nominal.capacity);
        assert_eq!(hot.resources.thermal_state, ThermalState::Critical);
    }

    #[tokio::test]
    async fn test_signatures_and_thumbnails_with_image() {
        let mut pipeline = PipelineBuilder::new(TrackingConfig::default())
            .extractor(Arc::new(ColorHistogramExtractor::default()))
            .build()
            .unwrap();
        let image = Arc::new(RgbImage::from_pixel(64, 48, Rgb([200, 40, 40])));
        let start = Utc::now();

        pipeline
            .process(frame(0, start, vec![person(0.7)]).with_image(image.clone()))
            .await;
        let report = pipeline
            .process(frame(1, start, vec![person(0.7)]).with_image(image))
            .await;

        assert_eq!(report.extraction_failures, 0);
        let identity = &report.identities[0].identity;
        assert!(identity.signature.is_some());

        let record = &report.records[0];
        assert_eq!(record.reason, SaveReason::FirstOfClass);
        let thumbnail = record.thumbnail.as_ref().unwrap();
        assert_eq!(&thumbnail[..2], &[0xff, 0xd8]);

        // Saved signatures teach the classifier
        let classifier = pipeline.classifier().unwrap();
        assert_eq!(classifier.sample_counts().get("person"), Some(&1));
    }

    #[tokio::test]
    async fn test_missing_image_degrades_to_geometry() {
        let mut pipeline = PipelineBuilder::new(TrackingConfig::default())
            .extractor(Arc::new(ColorHistogramExtractor::default()))
            .build()
            .unwrap();
        let start = Utc::now();

        pipeline.process(frame(0, start, vec![person(0.6)])).await;
        let report = pipeline.process(frame(1, start, vec![person(0.6)])).await;

        assert_eq!(report.extraction_failures, 0);
        assert!(report.identities[0].identity.signature.is_none());
        assert_eq!(report.records[0].thumbnail, None);
    }
}
