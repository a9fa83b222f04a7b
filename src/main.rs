//! CLI Entry Point for optsw-ctrl
//!
//! Provides command-line interface for:
//! - Running the FG/PG control sequence (default when no subcommand is given)
//! - Sending one-off SCPI commands or a command file to an instrument
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Run the control sequence:
//! ```bash
//! FG_HOST=192.168.1.3 FG_PORT=5025 PG_HOST=192.168.1.4 PG_PORT=5025 optsw-ctrl
//! ```
//!
//! Send commands:
//! ```bash
//! optsw-ctrl send 192.168.1.3 5025 '*RST' 'SYST:ERR?'
//! optsw-ctrl send-file preset/3390_initialization.txt 192.168.1.4 5025
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use optsw_ctrl::config::{ControlConfig, DEFAULT_CONFIG_PATH};
use optsw_ctrl::logging::{self, TracingConfig};
use optsw_ctrl::scpi::{self, Exchange, SocketOptions};
use optsw_ctrl::sequencer::{terminal_confirmation, Sequencer, START_PROMPT};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Level;

#[derive(Parser)]
#[command(name = "optsw-ctrl")]
#[command(about = "SCPI control of a function generator and a pulse generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up both instruments, start them, and poll their error queues
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Send SCPI commands to one instrument
    Send {
        host: String,
        port: u16,
        /// Commands, sent in order
        #[arg(required = true)]
        commands: Vec<String>,
        #[command(flatten)]
        link: LinkArgs,
    },

    /// Send the SCPI commands written in a file to one instrument
    SendFile {
        path: PathBuf,
        host: String,
        port: u16,
        #[command(flatten)]
        link: LinkArgs,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[derive(clap::Args)]
struct LinkArgs {
    /// Socket timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Do not read a reply after commands ending in '?'
    #[arg(long)]
    no_receive: bool,
}

impl LinkArgs {
    fn options(&self) -> Result<SocketOptions> {
        let timeout = self
            .timeout
            .map(Duration::try_from_secs_f64)
            .transpose()
            .context("Invalid --timeout")?;
        Ok(SocketOptions::with_timeout(timeout))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_control(PathBuf::from(DEFAULT_CONFIG_PATH)).await,
        Some(Commands::Run { config }) => run_control(config).await,
        Some(Commands::Send {
            host,
            port,
            commands,
            link,
        }) => {
            logging::init(TracingConfig::new(Level::INFO))?;
            let exchanges =
                scpi::send_commands(&commands, &host, port, link.options()?, !link.no_receive).await?;
            print_replies(&exchanges);
            Ok(())
        }
        Some(Commands::SendFile {
            path,
            host,
            port,
            link,
        }) => {
            logging::init(TracingConfig::new(Level::INFO))?;
            let exchanges =
                scpi::send_commands_in(&path, &host, port, link.options()?, !link.no_receive).await?;
            print_replies(&exchanges);
            Ok(())
        }
        Some(Commands::Config { config }) => {
            let config = ControlConfig::load_from(&config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_control(config_path: PathBuf) -> Result<()> {
    let config = ControlConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load configuration ({})", config_path.display()))?;
    logging::init(TracingConfig::from_app_config(&config.application)?)?;

    tracing::info!(
        "FG {}:{}, PG {}:{}, presets in {}",
        config.fg.host,
        config.fg.port,
        config.pg.host,
        config.pg.port,
        config.sequence.preset_dir.display()
    );

    let cancel = interrupt_on_ctrl_c();
    let mut sequencer = Sequencer::connect(&config, cancel).await?;

    let result = sequencer.run(|| terminal_confirmation(START_PROMPT)).await;

    if let Err(err) = sequencer.close().await {
        tracing::warn!("Closing instrument connections: {}", err);
    }

    result?;
    tracing::info!("Control finished");
    Ok(())
}

/// Forward the first Ctrl+C into a cancellation flag.
///
/// A second Ctrl+C exits immediately, for an instrument that stopped
/// answering while no socket timeout is configured.
fn interrupt_on_ctrl_c() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let _ = cancel_tx.send(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted again, exiting without reset");
            std::process::exit(130);
        }
    });
    cancel_rx
}

fn print_replies(exchanges: &[Exchange]) {
    for exchange in exchanges {
        if let Some(response) = &exchange.response {
            println!("{}", response);
        }
    }
}
