//! Shared data models for the percept tracking pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Normalized geometry (boxes, velocities)
//! - Detector input frames
//! - Device resource state
//! - Persistence records and save reasons
//! - Spatial relationships and scene labels

pub mod detection;
pub mod geometry;
pub mod identity;
pub mod persistence;
pub mod relationship;
pub mod resources;

// Re-export common types
pub use detection::{Detection, DetectionFrame};
pub use geometry::{BoundingBox, Velocity, FRAME_DIAGONAL};
pub use identity::IdentityId;
pub use persistence::{PersistenceRecord, SaveReason};
pub use relationship::{Activity, RelationType, Relationship, SceneType};
pub use resources::{MemoryPressure, ResourceParseError, ResourceState, ThermalState};
