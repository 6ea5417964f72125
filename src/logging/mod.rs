//! Logging configuration and initialization.
//!
//! Centralized setup for the `tracing` ecosystem. The cache itself only
//! emits events (trace-level allocation logs, debug-level trim reports,
//! warn-level leak reports); embedding applications that already install
//! a subscriber can ignore this module entirely.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info,streamalloc=trace")
//! - `STREAMALLOC_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `STREAMALLOC_LOG_FORMAT`: output format ("human" or "json")

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVEL_ENV: &str = "STREAMALLOC_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "STREAMALLOC_LOG_FORMAT";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format string provided
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize tracing from the environment. Safe to call more than once;
/// only the first call installs a subscriber.
pub fn init() -> Result<(), LoggingError> {
    let level = match std::env::var(LOG_LEVEL_ENV) {
        Ok(value) => LogLevel::parse(&value).ok_or(LoggingError::InvalidLogLevel(value))?,
        Err(_) => LogLevel::default(),
    };
    let format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(value) => LogFormat::parse(&value).ok_or(LoggingError::InvalidLogFormat(value))?,
        Err(_) => LogFormat::default(),
    };
    init_with(level, format);
    Ok(())
}

/// Initialize tracing with explicit settings, ignoring the environment
/// except for `RUST_LOG` (which always wins when set).
pub fn init_with(level: LogLevel, format: LogFormat) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},streamalloc={}",
                DEFAULT_LOG_LEVEL,
                level.as_filter_str()
            ))
        });

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);

        // try_init: embedding applications may have installed their own
        // subscriber first, which is fine.
        let result = match format {
            LogFormat::Human => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed, leaving it in place");
        }
    });
}
