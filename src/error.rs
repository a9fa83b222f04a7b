//! Custom error types for the controller.
//!
//! `CtrlError` is the single error type shared by the command socket, the
//! control sequencer and the configuration/logging setup. It is built with
//! `thiserror` so lower-level errors convert through `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the peer refused, reset or otherwise broke the stream.
//! - **`ConnectionClosed`**: the peer closed the stream cleanly while a reply
//!   was expected.
//! - **`Timeout`**: no progress within the configured socket timeout.
//! - **`Decode`** / **`Encode`**: bytes on the wire that are not ASCII text.
//! - **`CommandFile`**: a command file could not be read from disk.
//! - **`Config`** / **`Configuration`**: figment extraction failures and
//!   semantic validation failures respectively.
//! - **`Operator`**: the terminal could not be read for confirmation.
//! - **`Logging`**: the tracing subscriber could not be installed.
//!
//! An operator interrupt is not an error; the sequencer reports it as
//! `StepOutcome::Interrupted`.
//!
//! After `Connection`, `ConnectionClosed` or `Timeout` the stream can no
//! longer be trusted: a late reply or a half-written line may still be in
//! flight, so no further command goes out on it.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, CtrlError>;

/// Errors raised by the controller.
#[derive(Error, Debug)]
pub enum CtrlError {
    /// Connecting, reading or writing failed at the transport level
    #[error("Connection error with {peer}: {source}")]
    Connection {
        /// Instrument address
        peer: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// The instrument closed the stream while a reply was expected
    #[error("Connection closed by {0}")]
    ConnectionClosed(String),

    /// A connect, read or write made no progress in time
    #[error("Timed out after {timeout:?} waiting on {peer}")]
    Timeout {
        /// Instrument address
        peer: String,
        /// The configured socket timeout
        timeout: Duration,
    },

    /// A reply contained bytes outside ASCII
    #[error("Received non-ASCII bytes from {peer}")]
    Decode {
        /// Instrument address
        peer: String,
    },

    /// A command contained characters outside ASCII
    #[error("Command is not ASCII text: {0}")]
    Encode(String),

    /// A command file could not be read
    #[error("Failed to read command file {}: {source}", path.display())]
    CommandFile {
        /// Path of the command file
        path: PathBuf,
        /// Underlying file system error
        #[source]
        source: std::io::Error,
    },

    /// Configuration sources could not be merged or extracted
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The terminal could not be read for the start confirmation
    #[error("Failed to read operator input: {0}")]
    Operator(std::io::Error),

    /// The tracing subscriber could not be installed
    #[error("Logging setup error: {0}")]
    Logging(String),

    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtrlError {
    /// True when the connection this error came from can no longer carry commands.
    ///
    /// Includes `Timeout`, after which the stream may still deliver the late
    /// reply or hold a partially written line.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed(_) | Self::Timeout { .. }
        )
    }
}
