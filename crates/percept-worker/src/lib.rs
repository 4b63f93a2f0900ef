//! Frame-cycle worker.
//!
//! This crate provides:
//! - JSON-lines detection replay into the frame driver
//! - JSON-lines persistence of saved observations
//! - Background maintenance and graceful shutdown
//! - Structured frame logging and Prometheus export

pub mod config;
pub mod error;
pub mod logging;
pub mod runner;
pub mod sink;
pub mod source;

pub use config::{ExtractorKind, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::{init_logging, FrameLogger};
pub use runner::{install_metrics_exporter, RunSummary, Worker};
pub use sink::JsonLinesSink;
pub use source::{SourceLine, SourceStats};
