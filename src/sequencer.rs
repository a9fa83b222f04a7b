//! Control sequence for the function generator (FG) and pulse generator (PG).
//!
//! The sequencer owns one [`CommandSocket`] per instrument and drives them
//! through four phases:
//!
//! 1. **Setup**: replay the FG setup files, then the PG setup files.
//! 2. **Gate**: wait for the operator to confirm the start.
//! 3. **Start**: enable FG outputs and continuous triggering, let the FG
//!    settle, then enable PG outputs and triggering.
//! 4. **Poll**: query both error queues every poll interval until interrupted.
//!
//! Each phase step returns a [`StepOutcome`]. Interruption arrives through a
//! `watch` flag and is checked at the gate, during the settle delay and at
//! every poll interval boundary; a socket exchange that is already in flight
//! always completes first. Once setup is done, the reset files are replayed to
//! both instruments no matter how the gate/start/poll phases ended.

use crate::config::{ControlConfig, SequenceConfig};
use crate::error::{AppResult, CtrlError};
use crate::scpi::{CommandSocket, InstrumentIo};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};

/// Prompt shown while waiting for the operator
pub const START_PROMPT: &str = "Type any key to start control: ";

/// User-facing notice printed when the operator stops the control loop
pub const INTERRUPTED_NOTICE: &str = "Control was interrupted by user";

/// Operator answer: a line, `None` on end of input, or a terminal error
pub type Confirmation = oneshot::Receiver<io::Result<Option<String>>>;

/// Result of one sequencer step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Proceed to the next step
    Continue,
    /// The operator asked to stop
    Interrupted,
    /// An exchange with an instrument failed
    Failed(CtrlError),
}

/// The two instruments under control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    /// Function generator
    Fg,
    /// Pulse generator
    Pg,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Fg => write!(f, "FG"),
            Instrument::Pg => write!(f, "PG"),
        }
    }
}

/// Files, commands and timings of one control run.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPlan {
    /// FG command files replayed during setup, in order
    pub fg_setup: Vec<PathBuf>,
    /// PG command files replayed during setup, in order
    pub pg_setup: Vec<PathBuf>,
    /// FG command file replayed on reset
    pub fg_reset: PathBuf,
    /// PG command file replayed on reset
    pub pg_reset: PathBuf,
    /// Commands that enable the FG outputs and triggering
    pub fg_start: Vec<String>,
    /// Commands that enable the PG outputs and triggering
    pub pg_start: Vec<String>,
    /// Error-queue query sent to both instruments each poll
    pub poll_command: String,
    /// Pause between the FG and the PG start commands
    pub settle_delay: Duration,
    /// Pause between two polls
    pub poll_interval: Duration,
}

impl ControlPlan {
    /// Resolve the configured file names against the preset directory.
    ///
    /// Expects a configuration that passed [`ControlConfig::validate`].
    pub fn from_config(config: &SequenceConfig) -> Self {
        let preset = |name: &String| config.preset_dir.join(name);
        Self {
            fg_setup: config.fg_setup.iter().map(preset).collect(),
            pg_setup: config.pg_setup.iter().map(preset).collect(),
            fg_reset: preset(&config.fg_reset),
            pg_reset: preset(&config.pg_reset),
            fg_start: config.fg_start.clone(),
            pg_start: config.pg_start.clone(),
            poll_command: config.poll_command.clone(),
            settle_delay: Duration::from_secs_f64(config.settle_delay_secs),
            poll_interval: Duration::from_secs_f64(config.poll_interval_secs),
        }
    }
}

/// Drives the FG and PG through setup, start and error polling.
pub struct Sequencer<S: InstrumentIo = TcpStream> {
    fg: CommandSocket<S>,
    pg: CommandSocket<S>,
    plan: ControlPlan,
    cancel: watch::Receiver<bool>,
    fg_lost: bool,
    pg_lost: bool,
    polls: usize,
}

impl Sequencer<TcpStream> {
    /// Connect to both instruments named in `config`.
    ///
    /// The configuration is validated first. The FG connection is closed
    /// again if the PG cannot be reached.
    pub async fn connect(config: &ControlConfig, cancel: watch::Receiver<bool>) -> AppResult<Self> {
        config.validate()?;
        let options = config.socket_options();

        let fg = CommandSocket::connect_with(&config.fg.host, config.fg.port, options.clone())
            .await?
            .labelled("FG");
        let pg = match CommandSocket::connect_with(&config.pg.host, config.pg.port, options).await {
            Ok(pg) => pg.labelled("PG"),
            Err(err) => {
                if let Err(close_err) = fg.close().await {
                    tracing::warn!("Failed to close FG connection: {}", close_err);
                }
                return Err(err);
            }
        };

        tracing::info!("Connected to FG at {} and PG at {}", fg.peer(), pg.peer());
        Ok(Self::new(fg, pg, ControlPlan::from_config(&config.sequence), cancel))
    }
}

impl<S: InstrumentIo> Sequencer<S> {
    /// Sequencer over two already connected sockets.
    pub fn new(
        fg: CommandSocket<S>,
        pg: CommandSocket<S>,
        plan: ControlPlan,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            fg,
            pg,
            plan,
            cancel,
            fg_lost: false,
            pg_lost: false,
            polls: 0,
        }
    }

    /// Number of completed FG+PG error-queue polls.
    pub fn polls_completed(&self) -> usize {
        self.polls
    }

    /// Run the whole sequence.
    ///
    /// `confirm` is called once setup is done and must deliver the operator
    /// answer. Returns `Ok` when the operator stopped the run and the reset
    /// succeeded. Setup errors are returned without a reset; errors after
    /// setup are returned after the reset has been attempted.
    pub async fn run<G>(&mut self, confirm: G) -> AppResult<()>
    where
        G: FnOnce() -> Confirmation,
    {
        match self.setup().await {
            StepOutcome::Continue => {}
            StepOutcome::Interrupted => {
                self.notify_interrupted();
                return Ok(());
            }
            StepOutcome::Failed(err) => return Err(err),
        }

        let failure = match self.control(confirm).await {
            StepOutcome::Interrupted => {
                self.notify_interrupted();
                None
            }
            StepOutcome::Failed(err) => {
                tracing::error!("Control stopped on error: {}", err);
                Some(err)
            }
            StepOutcome::Continue => None,
        };

        let reset = self.reset().await;
        match failure {
            Some(err) => {
                if let Err(reset_err) = reset {
                    tracing::error!("Reset after failure did not complete: {}", reset_err);
                }
                Err(err)
            }
            None => reset,
        }
    }

    /// Replay the FG setup files, then the PG setup files.
    pub async fn setup(&mut self) -> StepOutcome {
        for path in &self.plan.fg_setup {
            if *self.cancel.borrow() {
                return StepOutcome::Interrupted;
            }
            if let Err(err) = self.fg.replay_file(path, true).await {
                self.fg_lost |= err.is_connection_lost();
                return StepOutcome::Failed(err);
            }
        }

        for path in &self.plan.pg_setup {
            if *self.cancel.borrow() {
                return StepOutcome::Interrupted;
            }
            if let Err(err) = self.pg.replay_file(path, true).await {
                self.pg_lost |= err.is_connection_lost();
                return StepOutcome::Failed(err);
            }
        }

        tracing::info!("FG and PG setup complete");
        StepOutcome::Continue
    }

    /// Gate, start, then poll until interrupted or failed.
    async fn control<G>(&mut self, confirm: G) -> StepOutcome
    where
        G: FnOnce() -> Confirmation,
    {
        macro_rules! step {
            ($outcome:expr) => {
                match $outcome {
                    StepOutcome::Continue => {}
                    other => return other,
                }
            };
        }

        step!(self.await_operator(confirm()).await);
        step!(self.start().await);
        loop {
            step!(self.poll_once().await);
            step!(self.pause(self.plan.poll_interval).await);
        }
    }

    /// Wait for the operator to confirm the start.
    pub async fn await_operator(&mut self, confirmation: Confirmation) -> StepOutcome {
        if self.is_cancelled() {
            return StepOutcome::Interrupted;
        }

        tokio::select! {
            answer = confirmation => match answer {
                Ok(Ok(Some(_))) => {
                    tracing::info!("Operator confirmed start");
                    StepOutcome::Continue
                }
                // End of input, or the prompt went away
                Ok(Ok(None)) | Err(_) => StepOutcome::Interrupted,
                Ok(Err(err)) => StepOutcome::Failed(CtrlError::Operator(err)),
            },
            _ = cancelled(&mut self.cancel) => StepOutcome::Interrupted,
        }
    }

    /// Enable the FG, wait the settle delay, then enable the PG.
    pub async fn start(&mut self) -> StepOutcome {
        if let Err(err) = send_all(&mut self.fg, &self.plan.fg_start).await {
            return self.failed(Instrument::Fg, err);
        }

        match self.pause(self.plan.settle_delay).await {
            StepOutcome::Continue => {}
            other => return other,
        }

        if let Err(err) = send_all(&mut self.pg, &self.plan.pg_start).await {
            return self.failed(Instrument::Pg, err);
        }

        tracing::info!("FG and PG started");
        StepOutcome::Continue
    }

    /// Query the FG error queue, then the PG error queue.
    pub async fn poll_once(&mut self) -> StepOutcome {
        if self.is_cancelled() {
            return StepOutcome::Interrupted;
        }

        for instrument in [Instrument::Fg, Instrument::Pg] {
            let socket = match instrument {
                Instrument::Fg => &mut self.fg,
                Instrument::Pg => &mut self.pg,
            };
            match socket.query(&self.plan.poll_command).await {
                Ok(reply) => {
                    if reports_error(&reply) {
                        tracing::warn!("{} error queue: {}", instrument, reply);
                    }
                }
                Err(err) => return self.failed(instrument, err),
            }
        }

        self.polls += 1;
        StepOutcome::Continue
    }

    /// Sleep for `duration` unless interrupted first. No socket I/O happens here.
    pub async fn pause(&mut self, duration: Duration) -> StepOutcome {
        if self.is_cancelled() {
            return StepOutcome::Interrupted;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => StepOutcome::Continue,
            _ = cancelled(&mut self.cancel) => StepOutcome::Interrupted,
        }
    }

    /// Replay the reset files, FG first.
    ///
    /// An instrument whose connection was lost is skipped. Both resets are
    /// attempted; the first error is returned.
    pub async fn reset(&mut self) -> AppResult<()> {
        let mut first_error = None;

        for instrument in [Instrument::Fg, Instrument::Pg] {
            let (socket, path, lost) = match instrument {
                Instrument::Fg => (&mut self.fg, &self.plan.fg_reset, self.fg_lost),
                Instrument::Pg => (&mut self.pg, &self.plan.pg_reset, self.pg_lost),
            };
            if lost {
                tracing::warn!("Skipping {} reset, connection lost", instrument);
                continue;
            }

            tracing::info!("Resetting {} from {}", instrument, path.display());
            if let Err(err) = socket.replay_file(path, true).await {
                tracing::error!("{} reset failed: {}", instrument, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close both connections, FG first.
    pub async fn close(self) -> AppResult<()> {
        let fg = self.fg.close().await;
        let pg = self.pg.close().await;
        fg.and(pg)
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn failed(&mut self, instrument: Instrument, err: CtrlError) -> StepOutcome {
        if err.is_connection_lost() {
            match instrument {
                Instrument::Fg => self.fg_lost = true,
                Instrument::Pg => self.pg_lost = true,
            }
        }
        StepOutcome::Failed(err)
    }

    fn notify_interrupted(&self) {
        println!("{}", INTERRUPTED_NOTICE);
        tracing::info!("{}", INTERRUPTED_NOTICE);
    }
}

async fn send_all<S: InstrumentIo>(socket: &mut CommandSocket<S>, commands: &[String]) -> AppResult<()> {
    for command in commands {
        socket.send(command).await?;
    }
    Ok(())
}

/// Resolves once the flag is set. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// True for an error-queue reply with a non-zero code, e.g. `-222,"Data out of range"`.
pub fn reports_error(reply: &str) -> bool {
    let code = reply.split(',').next().unwrap_or_default().trim();
    match code.parse::<i32>() {
        Ok(code) => code != 0,
        Err(_) => !code.is_empty(),
    }
}

/// Prompt on the terminal and read one line on a dedicated thread.
///
/// A pending terminal read never holds up the async runtime, so an
/// interrupt can end the wait at any time.
pub fn terminal_confirmation(prompt: &str) -> Confirmation {
    let (tx, rx) = oneshot::channel();
    let prompt = prompt.to_string();
    std::thread::spawn(move || {
        let _ = tx.send(read_confirmation(&prompt));
    });
    rx
}

fn read_confirmation(prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;

    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    Ok((read > 0).then_some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scpi::SocketOptions;
    use tokio_test::io::{Builder, Mock};
    use tracing_test::traced_test;

    fn socket(stream: Mock, peer: &str) -> CommandSocket<Mock> {
        CommandSocket::from_stream(stream, peer, SocketOptions::default())
    }

    fn plan_with(dir: &std::path::Path) -> ControlPlan {
        ControlPlan {
            fg_setup: vec![dir.join("fg_init.txt"), dir.join("fg_trigger.txt")],
            pg_setup: vec![dir.join("pg_init.txt")],
            fg_reset: dir.join("fg_init.txt"),
            pg_reset: dir.join("pg_init.txt"),
            fg_start: vec!["OUTP1 ON".into(), "INIT1:CONT ON".into()],
            pg_start: vec!["OUTP ON".into()],
            poll_command: "SYST:ERR?".into(),
            settle_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn write_presets(dir: &std::path::Path) {
        for (name, contents) in [
            ("fg_init.txt", "# reset\n*RST\n*CLS\n"),
            ("fg_trigger.txt", "TRIG1:SOUR EXT\n\n*OPC?\n"),
            ("pg_init.txt", "*RST\n"),
        ] {
            let mut file = std::fs::File::create(dir.join(name)).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
        }
    }

    fn confirmed() -> Confirmation {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(Some("\n".into()))).unwrap();
        rx
    }

    #[test]
    fn test_plan_from_config() {
        let plan = ControlPlan::from_config(&SequenceConfig::default());
        assert_eq!(plan.fg_setup.len(), 4);
        assert_eq!(plan.fg_setup[0], PathBuf::from("preset/33500B_initialization.txt"));
        assert_eq!(plan.pg_reset, PathBuf::from("preset/3390_initialization.txt"));
        assert_eq!(plan.settle_delay, Duration::from_secs(1));
        assert_eq!(plan.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_reports_error() {
        assert!(!reports_error("+0,\"No error\""));
        assert!(!reports_error("0,\"No error\""));
        assert!(reports_error("-222,\"Data out of range\""));
        assert!(reports_error("garbled"));
        assert!(!reports_error(""));
    }

    #[tokio::test]
    async fn test_setup_replays_fg_then_pg() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        let fg = Builder::new()
            .write(b"*RST\n")
            .write(b"*CLS\n")
            .write(b"TRIG1:SOUR EXT\n")
            .write(b"*OPC?\n")
            .read(b"1\n")
            .build();
        let pg = Builder::new().write(b"*RST\n").build();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut sequencer = Sequencer::new(
            socket(fg, "fg:5025"),
            socket(pg, "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );
        assert!(matches!(sequencer.setup().await, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn test_missing_setup_file_fails_without_reset() {
        let dir = tempfile::tempdir().unwrap();
        // No preset files written; nothing may reach either instrument
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut sequencer = Sequencer::new(
            socket(Builder::new().build(), "fg:5025"),
            socket(Builder::new().build(), "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        let err = sequencer.run(confirmed).await.unwrap_err();
        assert!(matches!(err, CtrlError::CommandFile { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_end_of_input_skips_start_but_resets() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        let fg = Builder::new()
            .write(b"*RST\n")
            .write(b"*CLS\n")
            .write(b"TRIG1:SOUR EXT\n")
            .write(b"*OPC?\n")
            .read(b"1\n")
            // reset
            .write(b"*RST\n")
            .write(b"*CLS\n")
            .build();
        let pg = Builder::new().write(b"*RST\n").write(b"*RST\n").build();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut sequencer = Sequencer::new(
            socket(fg, "fg:5025"),
            socket(pg, "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        let end_of_input = || {
            let (tx, rx) = oneshot::channel();
            tx.send(Ok(None)).unwrap();
            rx
        };
        sequencer.run(end_of_input).await.unwrap();
        assert_eq!(sequencer.polls_completed(), 0);
        assert!(logs_contain(INTERRUPTED_NOTICE));
        assert!(logs_contain("Resetting PG"));
    }

    #[tokio::test]
    async fn test_pause_interrupted() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut sequencer = Sequencer::new(
            socket(Builder::new().build(), "fg:5025"),
            socket(Builder::new().build(), "pg:5025"),
            plan_with(std::path::Path::new("preset")),
            cancel_rx,
        );

        cancel_tx.send(true).unwrap();
        let outcome = sequencer.pause(Duration::from_secs(60)).await;
        assert!(matches!(outcome, StepOutcome::Interrupted));
    }

    #[tokio::test]
    async fn test_pause_ignores_dropped_sender() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        let mut sequencer = Sequencer::new(
            socket(Builder::new().build(), "fg:5025"),
            socket(Builder::new().build(), "pg:5025"),
            plan_with(std::path::Path::new("preset")),
            cancel_rx,
        );

        let outcome = sequencer.pause(Duration::from_millis(5)).await;
        assert!(matches!(outcome, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn test_poll_failure_marks_connection_lost() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        // FG closes the stream instead of answering; only PG gets reset
        let fg = Builder::new().write(b"SYST:ERR?\n").build();
        let pg = Builder::new().write(b"*RST\n").build();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut sequencer = Sequencer::new(
            socket(fg, "fg:5025"),
            socket(pg, "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        let outcome = sequencer.poll_once().await;
        assert!(matches!(outcome, StepOutcome::Failed(CtrlError::ConnectionClosed(_))));
        sequencer.reset().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_poll_timeout_skips_that_reset() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        // The FG reply arrives too late to be read
        let fg = Builder::new()
            .write(b"SYST:ERR?\n")
            .wait(Duration::from_secs(5))
            .build();
        let pg = Builder::new().write(b"*RST\n").build();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let fg_options = SocketOptions::with_timeout(Some(Duration::from_millis(20)));
        let mut sequencer = Sequencer::new(
            CommandSocket::from_stream(fg, "fg:5025", fg_options),
            socket(pg, "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        let outcome = sequencer.poll_once().await;
        assert!(matches!(outcome, StepOutcome::Failed(CtrlError::Timeout { .. })));

        // Nothing may be written behind the unread reply
        sequencer.reset().await.unwrap();
        assert!(logs_contain("Skipping FG reset"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_after_setup_resets_the_other_instrument() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        let fg = Builder::new()
            // setup
            .write(b"*RST\n")
            .write(b"*CLS\n")
            .write(b"TRIG1:SOUR EXT\n")
            .write(b"*OPC?\n")
            .read(b"1\n")
            // start
            .write(b"OUTP1 ON\n")
            .write(b"INIT1:CONT ON\n")
            // first poll
            .write(b"SYST:ERR?\n")
            .read(b"+0,\"No error\"\n")
            // reset
            .write(b"*RST\n")
            .write(b"*CLS\n")
            .build();
        // PG hangs up instead of answering the first poll
        let pg = Builder::new()
            .write(b"*RST\n")
            .write(b"OUTP ON\n")
            .write(b"SYST:ERR?\n")
            .build();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut sequencer = Sequencer::new(
            socket(fg, "fg:5025"),
            socket(pg, "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        let err = sequencer.run(confirmed).await.unwrap_err();
        assert!(matches!(err, CtrlError::ConnectionClosed(_)));
        assert_eq!(sequencer.polls_completed(), 0);
        assert!(logs_contain("Resetting FG"));
        assert!(logs_contain("Skipping PG reset"));
        assert!(!logs_contain(INTERRUPTED_NOTICE));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_interrupt_before_setup_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_presets(dir.path());

        // Any write to these streams fails the run
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut sequencer = Sequencer::new(
            socket(Builder::new().build(), "fg:5025"),
            socket(Builder::new().build(), "pg:5025"),
            plan_with(dir.path()),
            cancel_rx,
        );

        cancel_tx.send(true).unwrap();
        sequencer.run(confirmed).await.unwrap();

        assert!(logs_contain(INTERRUPTED_NOTICE));
        assert!(!logs_contain("Resetting"));
    }
}
