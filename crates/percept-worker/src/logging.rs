//! Logging setup and structured frame-cycle logging.

use tracing::{debug, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use percept_tracking::FrameReport;

use crate::error::{WorkerError, WorkerResult};

/// Initialize tracing: colored output for dev, JSON when `LOG_FORMAT=json`.
///
/// `RUST_LOG` takes precedence; `PERCEPT_LOG` adds one more directive.
pub fn init_logging() -> WorkerResult<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    env_filter = env_filter
        .add_directive(parse_directive("percept_tracking=info")?)
        .add_directive(parse_directive("percept_worker=info")?);
    if let Ok(extra) = std::env::var("PERCEPT_LOG") {
        env_filter = env_filter.add_directive(parse_directive(&extra)?);
    }

    let result = if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .try_init()
    };
    result.map_err(|e| WorkerError::config_error(format!("failed to install tracing subscriber: {}", e)))
}

fn parse_directive(directive: &str) -> WorkerResult<tracing_subscriber::filter::Directive> {
    directive
        .parse()
        .map_err(|e| WorkerError::config_error(format!("invalid log directive '{}': {}", directive, e)))
}

/// Frame-cycle logger with consistent structured context.
#[derive(Debug, Clone)]
pub struct FrameLogger {
    source: String,
    operation: String,
}

impl FrameLogger {
    /// Create a logger for frames coming from `source`.
    ///
    /// # Arguments
    /// * `source` - Where frames come from (a file path or `stdin`)
    /// * `operation` - What is being done with them (e.g. "track")
    pub fn new(source: &str, operation: &str) -> Self {
        Self {
            source: source.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a run.
    pub fn log_start(&self, message: &str) {
        info!(
            source = %self.source,
            operation = %self.operation,
            "Run started: {}", message
        );
    }

    /// Log one frame report. Frames that saved something log at info.
    pub fn log_report(&self, report: &FrameReport) {
        let _guard = self.create_span(report.index).entered();
        if report.records.is_empty() {
            debug!(
                tracks = report.tracks.len(),
                identities = report.identities.len(),
                scheduled = report.scheduled.len(),
                capacity = report.capacity,
                "Frame processed"
            );
        } else {
            let reasons: Vec<&str> = report.records.iter().map(|r| r.reason.as_str()).collect();
            info!(
                tracks = report.tracks.len(),
                identities = report.identities.len(),
                minted = report.minted(),
                saved = report.records.len(),
                reasons = ?reasons,
                "Frame saved observations"
            );
        }

        if report.extraction_failures > 0 {
            warn!(failures = report.extraction_failures, "Signature extraction degraded");
        }
        if !report.evicted.is_empty() {
            debug!(evicted = report.evicted.len(), "Cache evicted identities");
        }
    }

    /// Log a warning during the run.
    pub fn log_warning(&self, message: &str) {
        warn!(
            source = %self.source,
            operation = %self.operation,
            "Run warning: {}", message
        );
    }

    /// Log the completion of a run.
    pub fn log_completion(&self, message: &str) {
        info!(
            source = %self.source,
            operation = %self.operation,
            "Run completed: {}", message
        );
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for one frame.
    pub fn create_span(&self, frame: u64) -> Span {
        tracing::info_span!(
            "frame",
            frame,
            source = %self.source,
            operation = %self.operation
        )
    }
}
