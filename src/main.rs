//! printlink - Command-line client for networked 3D printers
//!
//! Runs one command against a printer, or streams its state or progress
//! until interrupted.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use printlink_client::{CancellationToken, Client};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "printlink")]
#[command(about = "Command-line client for networked 3D printers")]
#[command(version)]
struct Cli {
    /// Printer address (overrides the config file)
    #[arg(short, long, env = "PRINTLINK_PRINTER")]
    printer: Option<SocketAddr>,

    /// Path to a YAML config file
    #[arg(short, long, env = "PRINTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show printer identity and status
    Info,

    /// Wait for the next state report
    State,

    /// Read the nozzle Z offset
    GetZOffset,

    /// Set the nozzle Z offset
    SetZOffset {
        /// Offset in millimetres
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },

    /// Run G-code lines
    Gcode {
        /// Lines to run, in order
        #[arg(required = true)]
        lines: Vec<String>,
    },

    /// Upload a G-code file
    Upload {
        /// File to upload
        path: PathBuf,
    },

    /// Start printing a file stored on the printer
    Start {
        /// File name on the printer
        name: String,
    },

    /// Stop the current print
    Stop,

    /// Set the head's current position
    SetPosition {
        #[arg(allow_negative_numbers = true)]
        x: f64,
        #[arg(allow_negative_numbers = true)]
        y: f64,
        #[arg(allow_negative_numbers = true)]
        z: f64,
    },

    /// Stream state reports until Ctrl+C
    WatchState,

    /// Stream upload and print progress until Ctrl+C
    WatchProgress,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).map_err(|e| {
        eprintln!("{}: {}", "Config error".red(), e);
        e
    })?;
    if let Some(printer) = cli.printer {
        config.printer = printer;
    }
    if let Some(timeout) = cli.timeout {
        config.request_timeout_ms = Some(timeout);
    }
    tracing::debug!("Using printer at {}", config.printer);

    let client = Client::new(config.connection_config());
    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let token = CancellationToken::new();
    let result = match cli.command {
        Commands::WatchState => commands::watch(client.state_stream(&token), token).await,
        Commands::WatchProgress => commands::watch(client.progress_stream(&token), token).await,
        cmd => commands::execute(&client, cmd).await.map(|output| {
            println!("{}", output);
        }),
    };
    client.close();

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}
