//! Configuration for the tracking pipeline.
//!
//! Every value has a documented default. `TrackingConfig::from_env` overrides
//! individual values from `PERCEPT_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TrackingError, TrackingResult};

/// Top-level configuration for the tracking pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub stabilizer: StabilizerConfig,
    pub identity: IdentityConfig,
    pub attention: AttentionConfig,
    pub cache: CacheConfig,
    pub save: SaveDecisionConfig,
    pub relationships: RelationshipConfig,
    pub recognition: RecognitionConfig,
    pub maintenance: MaintenanceConfig,
    pub driver: DriverConfig,
}

/// Detection stabilizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Minimum combined score for a detection to update a track (default: 0.3)
    pub match_threshold: f64,
    /// Weight of IoU in the combined score (default: 0.5)
    pub iou_weight: f64,
    /// Weight of center proximity in the combined score (default: 0.3)
    pub center_weight: f64,
    /// Weight of size ratio in the combined score (default: 0.2)
    pub size_weight: f64,
    /// Share of the old box kept when smoothing (default: 0.7)
    pub position_retain: f64,
    /// Share of the old confidence kept when smoothing (default: 0.8)
    pub confidence_retain: f64,
    /// IoU needed for a detection to reinforce a candidate (default: 0.3)
    pub candidate_iou_threshold: f64,
    /// Consecutive detections needed to confirm a candidate (default: 2)
    pub min_confirm_streak: u32,
    /// Confidence multiplier per missed frame (default: 0.9)
    pub miss_decay: f64,
    /// Missed frames during which the position keeps being extrapolated (default: 2)
    pub max_predicted_misses: u32,
    /// Track is removed once its miss count exceeds this (default: 2)
    pub max_misses: u32,
    /// Candidate is dropped once its miss count exceeds this (default: 1)
    pub candidate_max_misses: u32,
    /// Hard cap on confirmed and missing tracks (default: 20)
    pub max_confirmed: usize,
    /// Hard cap on candidates (default: 30)
    pub max_candidates: usize,
    /// Confirmed tracks below this confidence are not reported (default: 0.2)
    pub output_confidence_floor: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.3,
            iou_weight: 0.5,
            center_weight: 0.3,
            size_weight: 0.2,
            position_retain: 0.7,
            confidence_retain: 0.8,
            candidate_iou_threshold: 0.3,
            min_confirm_streak: 2,
            miss_decay: 0.9,
            max_predicted_misses: 2,
            max_misses: 2,
            candidate_max_misses: 1,
            max_confirmed: 20,
            max_candidates: 30,
            output_confidence_floor: 0.2,
        }
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Maximum center distance for a spatial match (default: 0.15)
    pub match_radius: f64,
    /// Cosine similarity needed when both sides carry a signature (default: 0.85)
    pub signature_threshold: f64,
    /// Kalman process noise on position (default: 1e-4)
    pub process_noise_pos: f64,
    /// Kalman process noise on velocity (default: 1e-4)
    pub process_noise_vel: f64,
    /// Kalman measurement noise (default: 1e-3)
    pub measurement_noise: f64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            match_radius: 0.15,
            signature_threshold: 0.85,
            process_noise_pos: 1e-4,
            process_noise_vel: 1e-4,
            measurement_noise: 1e-3,
        }
    }
}

/// Attention scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Capacity with no resource pressure (default: 10)
    pub base_capacity: usize,
    /// Capacity never drops below this (default: 1)
    pub min_capacity: usize,
    /// Identities below this confidence are not scheduled (default: 0.3)
    pub min_confidence: f64,
    pub size_weight: f64,
    pub confidence_weight: f64,
    pub center_weight: f64,
    pub motion_weight: f64,
    pub novelty_weight: f64,
    /// Motion score for identities with no displacement history (default: 0.5)
    pub new_object_motion: f64,
    /// Per-frame displacement that maps to a full motion score (default: 0.1)
    pub motion_normalization: f64,
    /// Capacity multiplier for CPU above 60% (default: 0.75)
    pub cpu_high_factor: f64,
    /// Capacity multiplier for CPU above 80% (default: 0.5)
    pub cpu_critical_factor: f64,
    pub memory_warning_factor: f64,
    pub memory_critical_factor: f64,
    pub thermal_fair_factor: f64,
    pub thermal_serious_factor: f64,
    pub thermal_critical_factor: f64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            base_capacity: 10,
            min_capacity: 1,
            min_confidence: 0.3,
            size_weight: 0.25,
            confidence_weight: 0.20,
            center_weight: 0.15,
            motion_weight: 0.30,
            novelty_weight: 0.10,
            new_object_motion: 0.5,
            motion_normalization: 0.1,
            cpu_high_factor: 0.75,
            cpu_critical_factor: 0.5,
            memory_warning_factor: 0.7,
            memory_critical_factor: 0.4,
            thermal_fair_factor: 0.8,
            thermal_serious_factor: 0.5,
            thermal_critical_factor: 0.25,
        }
    }
}

/// Short-term identity cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resident identities (default: 20)
    pub capacity: usize,
    /// Entries unseen for longer than this are expired (default: 30s)
    pub ttl_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            ttl_secs: 30.0,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        seconds(self.ttl_secs)
    }
}

/// Save/deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveDecisionConfig {
    /// Recent saves kept for comparison (default: 50)
    pub max_records: usize,
    /// Recent saves older than this are pruned (default: 60s)
    pub window_secs: f64,
    /// Similarity above which a recent save counts as a duplicate (default: 0.85)
    pub similarity_threshold: f64,
    /// Duplicates inside this window are never saved (default: 5s)
    pub cooldown_secs: f64,
    /// Confidence gain that justifies a new save (default: 0.15)
    pub confidence_delta: f64,
    /// IoU below which the object counts as moved (default: 0.3)
    pub movement_iou_threshold: f64,
    /// Age of the best match after which a refresh is saved (default: 30s)
    pub refresh_secs: f64,
    /// Neighbours consulted in the recent-saves index (default: 3)
    pub neighbors: usize,
    /// Weight of IoU in the geometric similarity blend (default: 0.6)
    pub geometric_iou_weight: f64,
    /// Lower bounds of the medium and high confidence tiers (default: 0.5, 0.75)
    pub confidence_tiers: [f64; 2],
    /// Save when the signature could not be computed (default: true)
    pub save_on_signature_failure: bool,
}

impl Default for SaveDecisionConfig {
    fn default() -> Self {
        Self {
            max_records: 50,
            window_secs: 60.0,
            similarity_threshold: 0.85,
            cooldown_secs: 5.0,
            confidence_delta: 0.15,
            movement_iou_threshold: 0.3,
            refresh_secs: 30.0,
            neighbors: 3,
            geometric_iou_weight: 0.6,
            confidence_tiers: [0.5, 0.75],
            save_on_signature_failure: true,
        }
    }
}

impl SaveDecisionConfig {
    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        seconds(self.cooldown_secs)
    }

    pub fn refresh(&self) -> chrono::Duration {
        seconds(self.refresh_secs)
    }
}

/// Relationship analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    pub enabled: bool,
    /// Overlap ratio above which a pair is overlapping (default: 0.2)
    pub overlap_threshold: f64,
    /// Center distance below which a pair is near (default: 0.1)
    pub near_distance: f64,
    /// A contained box is inside its container only below this size ratio (default: 0.5)
    pub inside_max_size_ratio: f64,
    /// Largest vertical gap for above/below (default: 0.15)
    pub vertical_gap: f64,
    /// Shared horizontal span, relative to the narrower box, for above/below (default: 0.3)
    pub min_horizontal_overlap: f64,
    /// Weight of co-occurrence history in scene scores (default: 0.05)
    pub history_weight: f64,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overlap_threshold: 0.2,
            near_distance: 0.1,
            inside_max_size_ratio: 0.5,
            vertical_gap: 0.15,
            min_horizontal_overlap: 0.3,
            history_weight: 0.05,
        }
    }
}

/// Known-object classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub enabled: bool,
    /// Neighbours consulted per prediction (default: 3)
    pub neighbors: usize,
    /// Confidence needed to report a known object (default: 0.6)
    pub confidence_threshold: f64,
    /// Most recent samples kept per label (default: 100)
    pub max_samples_per_class: usize,
    /// Where the classifier is loaded from and saved to
    pub model_path: Option<PathBuf>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            neighbors: 3,
            confidence_threshold: 0.6,
            max_samples_per_class: 100,
            model_path: None,
        }
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes (default: 5)
    pub interval_secs: f64,
    /// Pending records held for the sink (default: 256)
    pub outbox_capacity: usize,
    /// Records handed to the sink per flush (default: 64)
    pub flush_batch: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            outbox_capacity: 256,
            flush_batch: 64,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.interval_secs.max(0.01))
    }
}

/// Frame driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Frame cycles per second (default: 10)
    pub rate_hz: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { rate_hz: 10.0 }
    }
}

impl DriverConfig {
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.rate_hz.max(0.1))
    }
}

impl TrackingConfig {
    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> TrackingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.stabilizer.match_threshold =
            env_or("PERCEPT_MATCH_THRESHOLD", config.stabilizer.match_threshold);
        config.stabilizer.min_confirm_streak =
            env_or("PERCEPT_MIN_CONFIRM_STREAK", config.stabilizer.min_confirm_streak);
        config.stabilizer.max_misses = env_or("PERCEPT_MAX_MISSES", config.stabilizer.max_misses);
        config.stabilizer.max_confirmed =
            env_or("PERCEPT_MAX_CONFIRMED_TRACKS", config.stabilizer.max_confirmed);
        config.stabilizer.max_candidates =
            env_or("PERCEPT_MAX_CANDIDATES", config.stabilizer.max_candidates);
        config.stabilizer.output_confidence_floor = env_or(
            "PERCEPT_CONFIDENCE_FLOOR",
            config.stabilizer.output_confidence_floor,
        );

        config.identity.match_radius =
            env_or("PERCEPT_IDENTITY_RADIUS", config.identity.match_radius);
        config.identity.signature_threshold = env_or(
            "PERCEPT_SIGNATURE_THRESHOLD",
            config.identity.signature_threshold,
        );

        config.attention.base_capacity =
            env_or("PERCEPT_ATTENTION_CAPACITY", config.attention.base_capacity);
        config.attention.min_confidence =
            env_or("PERCEPT_ATTENTION_MIN_CONFIDENCE", config.attention.min_confidence);

        config.cache.capacity = env_or("PERCEPT_CACHE_CAPACITY", config.cache.capacity);
        config.cache.ttl_secs = env_or("PERCEPT_CACHE_TTL_SECS", config.cache.ttl_secs);

        config.save.max_records = env_or("PERCEPT_SAVE_MAX_RECORDS", config.save.max_records);
        config.save.window_secs = env_or("PERCEPT_SAVE_WINDOW_SECS", config.save.window_secs);
        config.save.cooldown_secs = env_or("PERCEPT_SAVE_COOLDOWN_SECS", config.save.cooldown_secs);
        config.save.similarity_threshold = env_or(
            "PERCEPT_SAVE_SIMILARITY_THRESHOLD",
            config.save.similarity_threshold,
        );
        config.save.confidence_delta =
            env_or("PERCEPT_SAVE_CONFIDENCE_DELTA", config.save.confidence_delta);
        config.save.refresh_secs = env_or("PERCEPT_SAVE_REFRESH_SECS", config.save.refresh_secs);

        config.relationships.enabled =
            env_or("PERCEPT_RELATIONSHIPS_ENABLED", config.relationships.enabled);

        config.recognition.enabled =
            env_or("PERCEPT_RECOGNITION_ENABLED", config.recognition.enabled);
        config.recognition.confidence_threshold = env_or(
            "PERCEPT_RECOGNITION_THRESHOLD",
            config.recognition.confidence_threshold,
        );
        config.recognition.model_path = std::env::var("PERCEPT_RECOGNITION_MODEL")
            .ok()
            .map(PathBuf::from)
            .or(config.recognition.model_path);

        config.maintenance.interval_secs = env_or(
            "PERCEPT_MAINTENANCE_INTERVAL_SECS",
            config.maintenance.interval_secs,
        );
        config.maintenance.outbox_capacity =
            env_or("PERCEPT_OUTBOX_CAPACITY", config.maintenance.outbox_capacity);

        config.driver.rate_hz = env_or("PERCEPT_FRAME_RATE_HZ", config.driver.rate_hz);

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> TrackingResult<()> {
        let s = &self.stabilizer;
        check_unit("stabilizer.match_threshold", s.match_threshold)?;
        check_unit("stabilizer.position_retain", s.position_retain)?;
        check_unit("stabilizer.confidence_retain", s.confidence_retain)?;
        check_unit("stabilizer.candidate_iou_threshold", s.candidate_iou_threshold)?;
        check_unit("stabilizer.miss_decay", s.miss_decay)?;
        check_unit("stabilizer.output_confidence_floor", s.output_confidence_floor)?;
        if s.min_confirm_streak == 0 {
            return Err(TrackingError::invalid_config(
                "stabilizer.min_confirm_streak must be at least 1",
            ));
        }
        if s.max_confirmed == 0 || s.max_candidates == 0 {
            return Err(TrackingError::invalid_config(
                "stabilizer track pools must hold at least one track",
            ));
        }

        check_unit("identity.signature_threshold", self.identity.signature_threshold)?;
        if !(self.identity.match_radius > 0.0) {
            return Err(TrackingError::invalid_config(
                "identity.match_radius must be positive",
            ));
        }

        let a = &self.attention;
        if a.min_capacity == 0 || a.base_capacity < a.min_capacity {
            return Err(TrackingError::invalid_config(
                "attention.base_capacity must be >= attention.min_capacity >= 1",
            ));
        }
        for (name, factor) in [
            ("attention.cpu_high_factor", a.cpu_high_factor),
            ("attention.cpu_critical_factor", a.cpu_critical_factor),
            ("attention.memory_warning_factor", a.memory_warning_factor),
            ("attention.memory_critical_factor", a.memory_critical_factor),
            ("attention.thermal_fair_factor", a.thermal_fair_factor),
            ("attention.thermal_serious_factor", a.thermal_serious_factor),
            ("attention.thermal_critical_factor", a.thermal_critical_factor),
        ] {
            check_unit(name, factor)?;
        }

        if self.cache.capacity == 0 {
            return Err(TrackingError::invalid_config("cache.capacity must be positive"));
        }
        if !(self.cache.ttl_secs > 0.0) {
            return Err(TrackingError::invalid_config("cache.ttl_secs must be positive"));
        }

        let v = &self.save;
        if v.max_records == 0 {
            return Err(TrackingError::invalid_config("save.max_records must be positive"));
        }
        check_unit("save.similarity_threshold", v.similarity_threshold)?;
        check_unit("save.geometric_iou_weight", v.geometric_iou_weight)?;
        if v.confidence_tiers[0] > v.confidence_tiers[1] {
            return Err(TrackingError::invalid_config(
                "save.confidence_tiers must be ascending",
            ));
        }

        check_unit(
            "recognition.confidence_threshold",
            self.recognition.confidence_threshold,
        )?;
        if self.recognition.neighbors == 0 {
            return Err(TrackingError::invalid_config(
                "recognition.neighbors must be positive",
            ));
        }

        if self.maintenance.outbox_capacity == 0 {
            return Err(TrackingError::invalid_config(
                "maintenance.outbox_capacity must be positive",
            ));
        }
        if !(self.driver.rate_hz > 0.0) {
            return Err(TrackingError::invalid_config("driver.rate_hz must be positive"));
        }

        Ok(())
    }
}

/// Seconds as a chrono duration, rounded to milliseconds.
pub(crate) fn seconds(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs.max(0.0) * 1000.0).round() as i64)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn check_unit(name: &str, value: f64) -> TrackingResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TrackingError::invalid_config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}
