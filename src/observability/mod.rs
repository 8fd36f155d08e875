//! # Observability
//!
//! Structured logging through `tracing` and release metrics through the
//! `metrics` facade.

// Logging configuration
pub mod config;

// Subscriber setup and log redaction
pub mod logging;

// Release counters and histograms
pub mod metrics;

pub use config::{LogConfig, LogFormat};
pub use logging::{init_logging, redact_url};
