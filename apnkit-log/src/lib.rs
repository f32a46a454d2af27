//! apnkit Logging
//!
//! Installs a `tracing` subscriber configured from `APNKIT_*` environment
//! variables. Library code logs through `tracing` macros only; the host
//! application calls [`init`] once at startup.
//!
//! # Usage
//!
//! ```rust,no_run
//! apnkit_log::init();
//! tracing::info!(app_id = 7, "Delivering notifications");
//! ```
//!
//! # Environment Variables
//!
//! - `APNKIT_DEBUG=1` - Enable debug logging
//! - `APNKIT_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `APNKIT_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `APNKIT_LOG_COLOR=1|0` - Enable/disable colors
//! - `APNKIT_LOG_TIMESTAMPS=1|0` - Include timestamps
//! - `APNKIT_LOG_MODULE=1|0` - Include the module path
//!
//! `RUST_LOG`, when set, replaces the level filter.

use once_cell::sync::Lazy;
use std::env;
use std::fmt;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum level of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
    /// Off (no logging)
    Off,
}

impl Level {
    /// Filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_filter().to_uppercase())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

static CONFIG: Lazy<LogConfig> = Lazy::new(LogConfig::from_env);

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include module path
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false, // JSON output doesn't use colors
            timestamps: true,
            module_path: true,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let debug = lookup("APNKIT_DEBUG").is_some_and(|v| flag(&v));

        let level = lookup("APNKIT_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("APNKIT_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Json);

        let color = match lookup("APNKIT_LOG_COLOR") {
            Some(v) => flag(&v),
            None => format != Format::Json && lookup("NO_COLOR").is_none() && lookup("TERM").is_some(),
        };

        let timestamps = lookup("APNKIT_LOG_TIMESTAMPS").is_none_or(|v| flag(&v));
        let module_path = lookup("APNKIT_LOG_MODULE").is_none_or(|v| flag(&v));

        Self {
            debug,
            level,
            format,
            color,
            timestamps,
            module_path,
        }
    }

    /// Level filter, overridden by `RUST_LOG` when set.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_filter()))
    }

    /// Formatting layer for this configuration.
    pub fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.color)
            .with_target(self.module_path);

        match (self.format, self.timestamps) {
            (Format::Json, true) => layer.json().with_timer(ChronoUtc::rfc_3339()).boxed(),
            (Format::Json, false) => layer.json().without_time().boxed(),
            (Format::Compact, true) => layer.compact().with_timer(ChronoUtc::rfc_3339()).boxed(),
            (Format::Compact, false) => layer.compact().without_time().boxed(),
            (Format::Pretty, true) => layer.pretty().with_timer(ChronoUtc::rfc_3339()).boxed(),
            (Format::Pretty, false) => layer.pretty().without_time().boxed(),
        }
    }

    /// Install this configuration as the global subscriber.
    pub fn try_init(&self) -> Result<(), TryInitError> {
        tracing_subscriber::registry()
            .with(self.filter())
            .with(self.layer())
            .try_init()
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Get the configuration read from the environment.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

/// Install the global subscriber, ignoring an already installed one.
pub fn init() {
    let _ = try_init();
}

/// Install the global subscriber.
///
/// Fails if a global subscriber was already set.
pub fn try_init() -> Result<(), TryInitError> {
    config().try_init()
}
