//! Detection stabilization, identity tracking and object memory.
//!
//! This crate provides:
//! - Stabilization of raw per-frame detections into confirmed tracks
//! - Persistent identities with Kalman motion prediction and appearance re-id
//! - Attention scheduling under CPU, memory and thermal pressure
//! - A short-term LRU + TTL identity cache
//! - Save/deduplication decisions over a rolling k-NN index of recent saves
//! - Spatial relationships, scene and activity inference
//! - Few-shot known-object recognition
//! - A fixed-rate frame driver and background maintenance

pub mod attention;
pub mod cache;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod identity;
pub mod maintenance;
pub mod metrics;
pub mod motion;
pub mod outbox;
pub mod pipeline;
pub mod pipeline_builder;
pub mod providers;
pub mod recognition;
pub mod relationships;
pub mod save_decision;
pub mod similarity;
pub mod stabilizer;
pub mod thumbnail;

pub use attention::{AttentionScheduler, AttentionScore, ScheduledIdentity};
pub use cache::{CacheStats, ShortTermCache};
pub use clock::FrameClock;
pub use config::TrackingConfig;
pub use driver::{frame_channel, DriverStats, FrameDriver, FrameSender};
pub use error::{TrackingError, TrackingResult};
pub use identity::{IdentityResolver, MatchKind, ResolvedTrack, TrackedIdentity};
pub use maintenance::{MaintenanceCycle, MaintenanceReport};
pub use motion::MotionFilter;
pub use outbox::{OutboxStats, PersistenceOutbox};
pub use pipeline::{Frame, FramePipeline, FrameReport, SaveOutcome};
pub use pipeline_builder::PipelineBuilder;
pub use providers::{
    ColorHistogramExtractor, FeatureExtractor, MemorySink, NominalResourceMonitor, NoopExtractor,
    NullSink, PersistenceSink, ResourceMonitor, SharedResourceMonitor,
};
pub use recognition::{KnnClassifier, Recognition};
pub use relationships::{RelationshipAnalyzer, SceneAnalysis};
pub use save_decision::{
    Observation, SaveDecision, SaveDecisionEngine, SaveRecord, SignatureStatus,
};
pub use stabilizer::{StabilizedTrack, Stabilizer, TrackState};
