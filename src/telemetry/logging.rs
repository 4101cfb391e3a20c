//! Logging configuration and initialization.
//!
//! `RUST_LOG` wins when set. Otherwise the `[log]` table picks the default
//! level, optional per-module levels and the output format:
//!
//! ```toml
//! [log]
//! level = "info"
//! format = "json"
//!
//! [log.targets]
//! "shadowlink::mirror" = "debug"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Output formats accepted in `log.format`.
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Level names accepted in `log.level` and `log.targets`.
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Logging configuration from the `[log]` table of config.toml.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
    /// Per-module level overrides, keyed by tracing target
    pub targets: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LogConfig {
    /// Creates a new LogConfig with default values.
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            targets: BTreeMap::new(),
        }
    }

    /// `EnvFilter` directive string, e.g. `info,shadowlink::mirror=debug`.
    /// Unknown level names fall back to info.
    pub fn directive(&self) -> String {
        let mut directive = level_name(parse_level(&self.level)).to_string();
        for (target, level) in &self.targets {
            directive.push(',');
            directive.push_str(target);
            directive.push('=');
            directive.push_str(level_name(parse_level(level)));
        }
        directive
    }

    fn output(&self) -> Output {
        match self.format.as_str() {
            "json" => Output::Json,
            "compact" => Output::Compact,
            _ => Output::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Pretty,
    Compact,
    Json,
}

/// Initializes the logging system.
///
/// Priority:
/// 1. RUST_LOG environment variable (if set)
/// 2. config parameter (if provided)
/// 3. Default: info level, pretty format
///
/// Only the first call installs a subscriber; later calls are ignored.
pub fn init_logging(config: Option<&LogConfig>) {
    let defaults = LogConfig::new();
    let config = config.unwrap_or(&defaults);

    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.directive())
    };

    let installed = match config.output() {
        Output::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        Output::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        Output::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Parses a log level string into a Level.
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}
