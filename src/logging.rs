//! Structured logging for Hesperus
//!
//! Thin wrapper around the tracing ecosystem: one idempotent init entry
//! point driven by [`LoggingConfig`], console and optional non-blocking file
//! output, plain or JSON formatting. Message-stream noise (unparsable
//! topics, unmatched descriptors, null decodes) is emitted at debug level by
//! the engine and filtered here.

use crate::config::LoggingConfig;
use crate::error::{HubError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Initialize the logging system based on configuration.
///
/// Safe to call more than once; only the first call configures the global
/// subscriber, later calls are no-ops (or return the recorded first error).
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = try_init(config);
        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    match INIT_ERROR.get() {
        Some(message) => Err(HubError::config(message.clone())),
        None => Ok(()),
    }
}

fn try_init(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = build_env_filter(level);

    let console_layer = config.console_output.then(|| {
        if config.json_format {
            fmt::layer().json().with_target(true).boxed()
        } else {
            fmt::layer().with_target(true).boxed()
        }
    });

    let file_layer = match &config.file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| HubError::config(format!("Invalid log file path: {file}")))?;
            let appender = rolling::never(dir, name);
            let (writer, guard) = non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| HubError::config(format!("Failed to set subscriber: {e}")))?;

    Ok(())
}

/// Parse a log level string into a tracing level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        other => Err(HubError::config(format!("Invalid log level: {other}"))),
    }
}

/// Build an env filter honoring `RUST_LOG` with the configured default
fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").ok(), Some(Level::DEBUG));
        assert_eq!(parse_log_level("WARNING").ok(), Some(Level::WARN));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_init_logging_idempotent() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
