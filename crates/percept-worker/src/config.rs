//! Worker configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use percept_tracking::TrackingConfig;

use crate::error::{WorkerError, WorkerResult};

/// Which feature extractor the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractorKind {
    /// No signatures; deduplication is geometric
    #[default]
    None,
    /// Color histogram of the region; needs frame images
    ColorHistogram,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::None => "none",
            ExtractorKind::ColorHistogram => "histogram",
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExtractorKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "off" => Ok(ExtractorKind::None),
            "histogram" | "color" | "color-histogram" => Ok(ExtractorKind::ColorHistogram),
            other => Err(WorkerError::config_error(format!("unknown extractor: {}", other))),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// JSON-lines detection input; stdin when unset
    pub input: Option<PathBuf>,
    /// JSON-lines persistence output
    pub output: PathBuf,
    /// Rate at which input lines are replayed; 0 reads as fast as possible
    pub source_fps: f64,
    pub extractor: ExtractorKind,
    /// Prometheus listener; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Graceful shutdown timeout for the final maintenance flush
    pub shutdown_timeout: Duration,
    pub tracking: TrackingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            input: None,
            output: PathBuf::from("percept-records.jsonl"),
            source_fps: 10.0,
            extractor: ExtractorKind::None,
            metrics_addr: None,
            shutdown_timeout: Duration::from_secs(10),
            tracking: TrackingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    ///
    /// Tracking settings come from the JSON file named by
    /// `PERCEPT_TRACKING_CONFIG` when set, otherwise from `PERCEPT_*`
    /// variables on top of the defaults.
    pub fn from_env() -> WorkerResult<Self> {
        let tracking = match std::env::var("PERCEPT_TRACKING_CONFIG") {
            Ok(path) => TrackingConfig::from_json_file(path)?,
            Err(_) => TrackingConfig::from_env(),
        };

        let extractor = match std::env::var("PERCEPT_EXTRACTOR") {
            Ok(value) => value.parse()?,
            Err(_) => ExtractorKind::None,
        };

        let metrics_addr = match std::env::var("PERCEPT_METRICS_ADDR") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().parse().map_err(|_| {
                WorkerError::config_error(format!("invalid PERCEPT_METRICS_ADDR: {}", value))
            })?),
            _ => None,
        };

        let config = Self {
            input: std::env::var("PERCEPT_INPUT")
                .ok()
                .filter(|s| !s.is_empty() && s != "-")
                .map(PathBuf::from),
            output: std::env::var("PERCEPT_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("percept-records.jsonl")),
            source_fps: std::env::var("PERCEPT_SOURCE_FPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10.0),
            extractor,
            metrics_addr,
            shutdown_timeout: Duration::from_secs(
                std::env::var("PERCEPT_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            tracking,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if !self.source_fps.is_finite() || self.source_fps < 0.0 {
            return Err(WorkerError::config_error(format!(
                "source fps must be a non-negative number, got {}",
                self.source_fps
            )));
        }
        if self.output.as_os_str().is_empty() {
            return Err(WorkerError::config_error("output path is empty"));
        }
        self.tracking.validate()?;
        Ok(())
    }

    /// Delay between replayed input lines, if paced.
    pub fn source_period(&self) -> Option<Duration> {
        (self.source_fps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.source_fps))
    }
}
