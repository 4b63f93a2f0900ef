//! Provider traits for the pipeline's external collaborators.
//!
//! Each collaborator has one concrete implementation and one that stands
//! in when the collaborator is missing, so the pipeline never has to
//! special-case an absent dependency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use image::RgbImage;
use percept_models::{BoundingBox, PersistenceRecord, ResourceState};

use crate::error::{TrackingError, TrackingResult};
use crate::similarity::l2_normalize;
use crate::thumbnail::crop_region;

// ============================================================================
// Feature extraction
// ============================================================================

/// Visual signature provider.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Compute a fixed-length, L2-normalized signature for a region.
    async fn extract(&self, image: Arc<RgbImage>, region: BoundingBox) -> TrackingResult<Vec<f32>>;

    /// Whether the extractor can produce signatures at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Joint RGB color histogram of the region.
pub struct ColorHistogramExtractor {
    bins_per_channel: u32,
}

impl ColorHistogramExtractor {
    /// Create an extractor with `bins_per_channel` bins per color channel.
    /// The signature has `bins_per_channel³` dimensions.
    pub fn new(bins_per_channel: u32) -> Self {
        Self {
            bins_per_channel: bins_per_channel.clamp(1, 16),
        }
    }

    pub fn dimensions(&self) -> usize {
        (self.bins_per_channel * self.bins_per_channel * self.bins_per_channel) as usize
    }
}

impl Default for ColorHistogramExtractor {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Histogram of a region, computed synchronously.
pub fn color_histogram(image: &RgbImage, region: &BoundingBox, bins: u32) -> TrackingResult<Vec<f32>> {
    let crop = crop_region(image, region)
        .ok_or_else(|| TrackingError::extraction_failed("region covers no pixels"))?;

    let bins = bins.max(1);
    let mut histogram = vec![0f32; (bins * bins * bins) as usize];
    for pixel in crop.pixels() {
        let [r, g, b] = pixel.0;
        let bin = |v: u8| (v as u32 * bins / 256) as usize;
        let index = (bin(r) * bins as usize + bin(g)) * bins as usize + bin(b);
        histogram[index] += 1.0;
    }

    l2_normalize(&mut histogram);
    Ok(histogram)
}

#[async_trait]
impl FeatureExtractor for ColorHistogramExtractor {
    async fn extract(&self, image: Arc<RgbImage>, region: BoundingBox) -> TrackingResult<Vec<f32>> {
        let bins = self.bins_per_channel;
        tokio::task::spawn_blocking(move || color_histogram(&image, &region, bins))
            .await
            .map_err(|e| TrackingError::internal(format!("histogram task failed: {}", e)))?
    }

    fn name(&self) -> &'static str {
        "color-histogram"
    }
}

/// Stand-in when no extractor is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExtractor;

#[async_trait]
impl FeatureExtractor for NoopExtractor {
    async fn extract(&self, _image: Arc<RgbImage>, _region: BoundingBox) -> TrackingResult<Vec<f32>> {
        Err(TrackingError::ExtractorUnavailable)
    }

    fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// ============================================================================
// Resource monitoring
// ============================================================================

/// Device resource source, polled once per frame cycle.
pub trait ResourceMonitor: Send + Sync {
    fn current(&self) -> ResourceState;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Always reports nominal resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct NominalResourceMonitor;

impl ResourceMonitor for NominalResourceMonitor {
    fn current(&self) -> ResourceState {
        ResourceState::nominal()
    }

    fn name(&self) -> &'static str {
        "nominal"
    }
}

/// Resource state pushed by the platform layer and polled by the pipeline.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct SharedResourceMonitor {
    state: Arc<RwLock<ResourceState>>,
}

impl SharedResourceMonitor {
    pub fn new(initial: ResourceState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
        }
    }

    /// Publish a new resource state.
    pub fn set(&self, state: ResourceState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl ResourceMonitor for SharedResourceMonitor {
    fn current(&self) -> ResourceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Append-only destination for saved observations.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist a batch of records. On error the whole batch is retried later.
    async fn persist(&self, records: &[PersistenceRecord]) -> TrackingResult<()>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn persist(&self, _records: &[PersistenceRecord]) -> TrackingResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Keeps records in memory; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<PersistenceRecord>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything persisted so far.
    pub fn records(&self) -> Vec<PersistenceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent `persist` calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, records: &[PersistenceRecord]) -> TrackingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TrackingError::sink_failed("memory sink set to fail", records.len()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;
    use chrono::Utc;
    use image::Rgb;
    use percept_models::{IdentityId, SaveReason};

    fn two_tone() -> Arc<RgbImage> {
        let mut image = RgbImage::from_pixel(20, 10, Rgb([250, 10, 10]));
        for x in 10..20 {
            for y in 0..10 {
                image.put_pixel(x, y, Rgb([10, 10, 250]));
            }
        }
        Arc::new(image)
    }

    #[tokio::test]
    async fn test_histogram_distinguishes_regions() {
        let extractor = ColorHistogramExtractor::default();
        let image = two_tone();
        let left = BoundingBox::new(0.0, 0.0, 0.5, 1.0);
        let right = BoundingBox::new(0.5, 0.0, 0.5, 1.0);

        let a = extractor.extract(image.clone(), left).await.unwrap();
        let b = extractor.extract(image.clone(), left).await.unwrap();
        let c = extractor.extract(image, right).await.unwrap();

        assert_eq!(a.len(), extractor.dimensions());
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c) < 0.1);
    }

    #[tokio::test]
    async fn test_histogram_rejects_empty_region() {
        let extractor = ColorHistogramExtractor::default();
        let result = extractor.extract(two_tone(), BoundingBox::new(3.0, 3.0, 0.1, 0.1)).await;
        assert!(matches!(result, Err(TrackingError::ExtractionFailed(_))));
    }

    #[test]
    fn test_noop_extractor_is_unavailable() {
        let extractor = NoopExtractor;
        assert!(!extractor.is_available());
        let result = tokio_test::block_on(extractor.extract(two_tone(), BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert!(matches!(result, Err(TrackingError::ExtractorUnavailable)));
    }

    #[test]
    fn test_shared_monitor_clones_share_state() {
        let monitor = SharedResourceMonitor::default();
        let platform = monitor.clone();
        assert!(monitor.current().is_nominal());

        platform.set(ResourceState::nominal().with_cpu(0.9));
        assert!((monitor.current().cpu_fraction() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_memory_sink_failure_mode() {
        let sink = MemorySink::new();
        let record = PersistenceRecord {
            identity_id: IdentityId::new(),
            label: "cup".to_string(),
            confidence: 0.7,
            bounding_box: BoundingBox::new(0.1, 0.1, 0.1, 0.1),
            class_index: 41,
            thumbnail: None,
            recognized_as: None,
            reason: SaveReason::FirstOfClass,
            timestamp: Utc::now(),
        };

        sink.set_failing(true);
        let err = sink.persist(std::slice::from_ref(&record)).await.unwrap_err();
        assert!(matches!(err, TrackingError::SinkFailed { records: 1, .. }));
        assert!(sink.is_empty());

        sink.set_failing(false);
        sink.persist(&[record]).await.unwrap();
        assert_eq!(sink.len(), 1);
    }
}
