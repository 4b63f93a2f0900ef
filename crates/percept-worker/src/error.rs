//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Source error: {0}")]
    SourceFailed(String),

    #[error("Metrics exporter error: {0}")]
    MetricsFailed(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Tracking error: {0}")]
    Tracking(#[from] percept_tracking::TrackingError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn source_failed(msg: impl Into<String>) -> Self {
        Self::SourceFailed(msg.into())
    }

    pub fn metrics_failed(msg: impl Into<String>) -> Self {
        Self::MetricsFailed(msg.into())
    }

    pub fn task_failed(msg: impl Into<String>) -> Self {
        Self::TaskFailed(msg.into())
    }

    /// Whether the worker can keep running after this error.
    ///
    /// Per-line input problems and sink hiccups are recoverable; broken
    /// configuration and failed background tasks are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkerError::Json(_) | WorkerError::Image(_) | WorkerError::Tracking(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(WorkerError::from(json).is_recoverable());
        assert!(!WorkerError::config_error("bad rate").is_recoverable());
        assert!(!WorkerError::task_failed("panicked").is_recoverable());
    }

    #[test]
    fn test_tracking_errors_convert() {
        let err: WorkerError = percept_tracking::TrackingError::invalid_config("cache.capacity").into();
        assert!(err.to_string().contains("cache.capacity"));
    }
}
