//! Configuration loading using Figment
//!
//! Configuration is merged from, in increasing priority:
//! 1. Built-in defaults (preset file names, timings, socket sizes)
//! 2. `config/optsw.toml` (or the file given on the command line), if present
//! 3. The instrument address variables `FG_HOST`, `FG_PORT`, `PG_HOST`, `PG_PORT`
//! 4. Environment variables prefixed with `OPTSW_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use optsw_ctrl::config::ControlConfig;
//!
//! let config = ControlConfig::load()?;
//! println!("FG at {}:{}", config.fg.host, config.fg.port);
//! # Ok::<(), optsw_ctrl::error::CtrlError>(())
//! ```

use crate::error::{AppResult, CtrlError};
use crate::scpi::{SocketOptions, DEFAULT_BUFFER_SIZE, DEFAULT_LOG_WIDTH};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/optsw.toml";

/// Variables read verbatim for the instrument addresses
const ADDRESS_VARS: [&str; 4] = ["FG_HOST", "FG_PORT", "PG_HOST", "PG_PORT"];

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Logging settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Function generator address
    pub fg: InstrumentAddress,
    /// Pulse generator address
    pub pg: InstrumentAddress,
    /// Socket settings shared by both instruments
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Setup files, start commands and timings of the control sequence
    #[serde(default)]
    pub sequence: SequenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format on stdout (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// File receiving a copy of every log line
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

/// Network address of one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentAddress {
    /// Host name or IP address
    pub host: String,
    /// TCP port of the SCPI socket server (5025 on most instruments)
    pub port: u16,
}

/// Socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect/read/write timeout in seconds; unset blocks indefinitely
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Maximum bytes of a single reply
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Characters of a command or reply shown in the log
    #[serde(default = "default_log_width")]
    pub log_width: usize,
}

/// Control sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Directory holding the command files
    #[serde(default = "default_preset_dir")]
    pub preset_dir: PathBuf,
    /// FG setup files, replayed in order
    #[serde(default = "default_fg_setup")]
    pub fg_setup: Vec<String>,
    /// PG setup files, replayed in order
    #[serde(default = "default_pg_setup")]
    pub pg_setup: Vec<String>,
    /// FG file replayed to reset the instrument on exit
    #[serde(default = "default_fg_reset")]
    pub fg_reset: String,
    /// PG file replayed to reset the instrument on exit
    #[serde(default = "default_pg_reset")]
    pub pg_reset: String,
    /// Commands enabling FG outputs and triggering
    #[serde(default = "default_fg_start")]
    pub fg_start: Vec<String>,
    /// Commands enabling PG outputs and triggering
    #[serde(default = "default_pg_start")]
    pub pg_start: Vec<String>,
    /// Query polled on both instruments
    #[serde(default = "default_poll_command")]
    pub poll_command: String,
    /// Pause between FG start and PG start, in seconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: f64,
    /// Pause between error-queue polls, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("optsw-ctrl.log"))
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_width() -> usize {
    DEFAULT_LOG_WIDTH
}

fn default_preset_dir() -> PathBuf {
    PathBuf::from("preset")
}

fn default_fg_setup() -> Vec<String> {
    vec![
        "33500B_initialization.txt".to_string(),
        "33500B_1pps_signal.txt".to_string(),
        "33500B_output_for_1Hz_switch.txt".to_string(),
        "33500B_trigger_for_1Hz_switch.txt".to_string(),
    ]
}

fn default_pg_setup() -> Vec<String> {
    vec![
        "3390_initialization.txt".to_string(),
        "3390_output_for_1Hz_switch_EE.txt".to_string(),
        "3390_trigger.txt".to_string(),
    ]
}

fn default_fg_reset() -> String {
    "33500B_initialization.txt".to_string()
}

fn default_pg_reset() -> String {
    "3390_initialization.txt".to_string()
}

fn default_fg_start() -> Vec<String> {
    vec![
        "OUTP1 ON".to_string(),
        "OUTP2 ON".to_string(),
        "INIT1:CONT ON".to_string(),
    ]
}

fn default_pg_start() -> Vec<String> {
    vec!["OUTP ON".to_string(), "OUTP:TRIG ON".to_string()]
}

fn default_poll_command() -> String {
    "SYST:ERR?".to_string()
}

fn default_settle_delay() -> f64 {
    1.0
}

fn default_poll_interval() -> f64 {
    10.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_file: default_log_file(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            buffer_size: default_buffer_size(),
            log_width: default_log_width(),
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            preset_dir: default_preset_dir(),
            fg_setup: default_fg_setup(),
            pg_setup: default_pg_setup(),
            fg_reset: default_fg_reset(),
            pg_reset: default_pg_reset(),
            fg_start: default_fg_start(),
            pg_start: default_pg_start(),
            poll_command: default_poll_command(),
            settle_delay_secs: default_settle_delay(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl ControlConfig {
    /// Load configuration from `config/optsw.toml` and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; the environment alone can supply
    /// the required instrument addresses.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`load_from`](Self::load_from)
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::raw().only(&ADDRESS_VARS).split("_"))
            .merge(Env::prefixed("OPTSW_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CtrlError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(CtrlError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for (name, address) in [("fg", &self.fg), ("pg", &self.pg)] {
            if address.host.trim().is_empty() {
                return Err(CtrlError::Configuration(format!("{}.host is empty", name)));
            }
            if address.port == 0 {
                return Err(CtrlError::Configuration(format!("{}.port must be non-zero", name)));
            }
        }

        if let Some(timeout) = self.connection.timeout_secs {
            seconds_to_duration("timeout_secs", timeout)?;
        }
        if self.connection.buffer_size == 0 {
            return Err(CtrlError::Configuration("buffer_size must be non-zero".into()));
        }
        if self.connection.log_width == 0 {
            return Err(CtrlError::Configuration("log_width must be non-zero".into()));
        }

        let sequence = &self.sequence;
        if sequence.fg_setup.is_empty() || sequence.pg_setup.is_empty() {
            return Err(CtrlError::Configuration(
                "fg_setup and pg_setup must each name at least one file".into(),
            ));
        }
        seconds_to_duration("settle_delay_secs", sequence.settle_delay_secs)?;
        if seconds_to_duration("poll_interval_secs", sequence.poll_interval_secs)?.is_zero() {
            return Err(CtrlError::Configuration(format!(
                "Invalid poll_interval_secs {}. Must be positive",
                sequence.poll_interval_secs
            )));
        }

        Ok(())
    }

    /// Socket options derived from the `[connection]` section
    ///
    /// Expects a configuration that passed [`validate`](Self::validate).
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            timeout: self.connection.timeout_secs.map(Duration::from_secs_f64),
            buffer_size: self.connection.buffer_size,
            log_width: self.connection.log_width,
        }
    }
}

/// Checks that `secs` converts to a `Duration`.
///
/// Rejects negative, non-finite and out-of-range values, all of which
/// `Duration::from_secs_f64` would panic on.
fn seconds_to_duration(key: &str, secs: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        CtrlError::Configuration(format!(
            "Invalid {} {}. Must be a non-negative number of seconds ({})",
            key, secs, e
        ))
    })
}
