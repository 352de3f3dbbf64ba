//! Structured logging setup.
//!
//! The runtime only emits `tracing` events; installing a subscriber is left
//! to the embedding application. [`init_logging`] is a ready-made one with an
//! `EnvFilter`, text or JSON output, and environment overrides:
//!
//! - `ENSEMBLE_LOG`: filter directives, replacing the configured level
//! - `ENSEMBLE_LOG_FORMAT`: `text` or `json`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Errors from logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log format: {0} (must be 'json' or 'text')")]
    InvalidFormat(String),

    #[error("Invalid log output: {0} (must be 'stdout' or 'stderr')")]
    InvalidOutput(String),

    #[error("Invalid log directive: {0}")]
    InvalidDirective(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Whether logging is enabled (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text (default: text)
    #[serde(default = "default_format")]
    pub format: String,

    /// Output destination: stdout, stderr (default: stderr)
    #[serde(default = "default_output")]
    pub output: String,

    /// Colored output (text format only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Module-specific log levels, e.g. `ensemble_core::dispatch = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_module(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.modules.insert(module.into(), level.into());
        self
    }
}

/// Install the global subscriber.
///
/// Fails if one is already installed, so tests and embedding apps can call
/// it without panicking.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = if config.enabled {
        build_env_filter(config)?
    } else {
        EnvFilter::new("off")
    };
    let format = determine_format(config)?;
    let writer = match config.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        "stderr" => BoxMakeWriter::new(std::io::stderr),
        other => return Err(LoggingError::InvalidOutput(other.to_string())),
    };

    let base_subscriber = Registry::default().with(filter);
    let result = if format == "json" {
        base_subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .try_init()
    } else {
        base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.color)
                    .with_writer(writer),
            )
            .try_init()
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Build environment filter from `ENSEMBLE_LOG` or the config.
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_env("ENSEMBLE_LOG") {
        return Ok(filter);
    }

    if config.level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.modules {
        let directive = format!("{module}={level}");
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| LoggingError::InvalidDirective(format!("{directive}: {e}")))?,
        );
    }
    Ok(filter)
}

fn determine_format(config: &LoggingConfig) -> Result<String, LoggingError> {
    if let Ok(format) = std::env::var("ENSEMBLE_LOG_FORMAT") {
        if format == "json" || format == "text" {
            return Ok(format);
        }
    }
    match config.format.as_str() {
        "json" | "text" => Ok(config.format.clone()),
        other => Err(LoggingError::InvalidFormat(other.to_string())),
    }
}
