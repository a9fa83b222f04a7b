//! # optsw-ctrl
//!
//! SCPI-over-TCP control of a function generator (FG) and a pulse generator
//! (PG). The library holds the pieces the `optsw-ctrl` binary is built from.
//!
//! ## Crate Structure
//!
//! - **`scpi`**: the `CommandSocket` line protocol client: send, receive,
//!   query and command-file replay over one TCP connection, plus the one-shot
//!   `send_commands` helpers.
//! - **`sequencer`**: the control sequence: setup replay, operator gate,
//!   start commands, error-queue polling and reset on interrupt.
//! - **`config`**: figment-based configuration from TOML and environment.
//! - **`logging`**: tracing subscriber setup for stdout and the log file.
//! - **`error`**: the `CtrlError` enum shared by all of the above.

pub mod config;
pub mod error;
pub mod logging;
pub mod scpi;
pub mod sequencer;

pub use error::{AppResult, CtrlError};
pub use scpi::{CommandSocket, Exchange, SocketOptions};
pub use sequencer::{ControlPlan, Sequencer, StepOutcome};
