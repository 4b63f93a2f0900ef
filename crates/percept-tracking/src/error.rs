//! Error types for tracking operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for tracking operations.
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Errors that can occur in the tracking subsystem.
///
/// None of these are fatal to a frame cycle: callers degrade to a
/// conservative default and keep going.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Feature extractor unavailable")]
    ExtractorUnavailable,

    #[error("Feature extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Persistence sink failed: {message}")]
    SinkFailed { message: String, records: usize },

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackingError {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an extraction failure error.
    pub fn extraction_failed(message: impl Into<String>) -> Self {
        Self::ExtractionFailed(message.into())
    }

    /// Create a sink failure error for a batch of records.
    pub fn sink_failed(message: impl Into<String>, records: usize) -> Self {
        Self::SinkFailed {
            message: message.into(),
            records,
        }
    }

    /// Create a classifier error.
    pub fn classifier(message: impl Into<String>) -> Self {
        Self::Classifier(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
