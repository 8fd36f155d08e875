//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber and keeps credentials out
//! of log lines.
//!
//! ## Key Features
//! - JSON or text output selected by [`LogConfig`]
//! - `RUST_LOG` directives layered over the configured level
//! - Password redaction for connection URLs

use tracing::{warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use url::Url;

use crate::observability::config::{LogConfig, LogFormat};

/// Install the global subscriber
///
/// A second call, or a subscriber installed by the embedding process, is
/// left in place.
pub fn init_logging(config: &LogConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(config.verbose)
                    .with_line_number(config.verbose)
                    .with_thread_ids(config.verbose),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.verbose)
                    .with_line_number(config.verbose)
                    .with_thread_ids(config.verbose),
            )
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
}

/// `url` with its password replaced by `***`
///
/// Unparseable input is returned as `<invalid url>` so it never leaks verbatim.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                // only fails for cannot-be-a-base URLs, which carry no password
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("redis://:hunter2@cache.internal:6379/0"),
            "redis://:***@cache.internal:6379/0"
        );
        assert_eq!(redact_url("redis://localhost:6379"), "redis://localhost:6379");
        assert_eq!(redact_url("not a url"), "<invalid url>");
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        let config = LogConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
