//! Tracing Infrastructure
//!
//! The logging context is configured once at process start and installed as
//! the global `tracing` subscriber. Every line carries a local timestamp and
//! a level, and goes to stdout and, when configured, to a log file.
//! Individual command sockets add their own span (instrument label and peer
//! address) on top of this context.
//!
//! # Example
//! ```no_run
//! use optsw_ctrl::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::INFO)
//!     .with_format(OutputFormat::Compact)
//!     .with_log_file("optsw-ctrl.log");
//! logging::init(config)?;
//! tracing::info!("Controller started");
//! # Ok(())
//! # }
//! ```

use crate::config::ApplicationConfig;
use crate::error::{AppResult, CtrlError};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for the stdout layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line format with colors (for development)
    Pretty,
    /// One line per event (default)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// File receiving a plain-text copy of every line
    pub log_file: Option<PathBuf>,
    /// Whether to enable ANSI colors on stdout
    pub with_ansi: bool,
    /// Whether to include the module path of each event
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            log_file: None,
            with_ansi: true,
            with_target: false,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the `[application]` configuration section
    pub fn from_app_config(config: &ApplicationConfig) -> AppResult<Self> {
        let level = parse_log_level(&config.log_level)?;
        let format = parse_output_format(&config.log_format)?;
        let log_file = config
            .log_file
            .clone()
            .filter(|path| !path.as_os_str().is_empty());

        Ok(Self {
            level,
            format,
            log_file,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Also write every line to `path` (appending)
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// `2024-01-31 12:00:00,123` in local time
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"))
    }
}

/// Initialize tracing with the given configuration
///
/// `RUST_LOG` takes precedence over the configured level when set. Calling
/// this again after a subscriber is installed is a no-op, which keeps it
/// safe in tests.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let mut layers = vec![stdout_layer(&config)];
    if let Some(path) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                CtrlError::Logging(format!("Failed to open log file {}: {}", path.display(), e))
            })?;

        let file_layer = fmt::layer()
            .with_timer(LocalTimer)
            .with_target(config.with_target)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed();
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .or_else(|e| {
            // Already initialized, expected in tests
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(CtrlError::Logging(format!("Failed to initialize tracing: {}", e)))
            }
        })
}

fn stdout_layer<S>(config: &TracingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_timer(LocalTimer)
        .with_target(config.with_target)
        .with_writer(std::io::stdout);

    match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(CtrlError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

/// Parse output format string
pub fn parse_output_format(format: &str) -> AppResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(CtrlError::Configuration(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        ))),
    }
}

/// Env filter directive for a level, e.g. `info`
fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("error"), Ok(Level::ERROR)));

        // Case insensitive
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));

        // Invalid
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_level_to_filter_string() {
        assert_eq!(level_to_filter_string(Level::WARN), "warn");
        assert_eq!(level_to_filter_string(Level::TRACE), "trace");
    }

    #[test]
    fn test_parse_output_format() {
        assert_eq!(parse_output_format("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(parse_output_format("compact").unwrap(), OutputFormat::Compact);
        assert!(parse_output_format("xml").is_err());
    }

    #[test]
    fn test_tracing_config_from_app_config() {
        let app = ApplicationConfig {
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
            log_file: Some(PathBuf::new()),
        };

        let config = TracingConfig::from_app_config(&app).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Pretty);
        // An empty path turns the file copy off
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_log_file("ctrl.log")
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.log_file, Some(PathBuf::from("ctrl.log")));
        assert!(!config.with_ansi);
    }
}
