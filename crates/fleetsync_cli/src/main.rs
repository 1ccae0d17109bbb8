//! fleetsync CLI
//!
//! Command-line tools for the fleetsync state-sync engine.
//!
//! # Commands
//!
//! - `replay` - Apply a captured frame stream to a fresh store
//! - `backoff` - Print a reconnect schedule
//! - `serve` - Run the WebSocket demo backend
//! - `watch` - Connect to a backend and log every change

mod commands;

use clap::{Parser, Subcommand};
use fleetsync_protocol::EntityKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fleetsync command-line tools.
#[derive(Parser)]
#[command(name = "fleetsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a JSON-lines capture of server frames to a fresh store
    Replay {
        /// Capture file, one server frame per line
        file: PathBuf,

        /// Only show this kind
        #[arg(short, long)]
        kind: Option<EntityKind>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the reconnect schedule for a backoff configuration
    Backoff {
        /// Delay before the first retry, in milliseconds
        #[arg(long, default_value = "1000")]
        base_ms: u64,

        /// Multiplier between attempts
        #[arg(long, default_value = "2.0")]
        factor: f64,

        /// Cap on the delay, in milliseconds
        #[arg(long, default_value = "30000")]
        max_ms: u64,

        /// Number of failed attempts to plan
        #[arg(short, long, default_value = "8")]
        attempts: u32,

        /// Jitter fraction
        #[arg(short, long, default_value = "0.0")]
        jitter: f64,

        /// Seed for the jitter source
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the WebSocket demo backend
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Require clients to present this bearer token
        #[arg(short, long)]
        token: Option<String>,

        /// Do not echo correlation ids on confirming events
        #[arg(long)]
        no_echo: bool,
    },

    /// Connect to a backend and log every change until interrupted
    Watch {
        /// JSON engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Backend endpoint (overrides the configuration file)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Bearer token
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replay { file, kind, format } => {
            commands::replay::run(&file, kind, &format)?;
        }
        Commands::Backoff {
            base_ms,
            factor,
            max_ms,
            attempts,
            jitter,
            seed,
            format,
        } => {
            commands::backoff::run(base_ms, factor, max_ms, attempts, jitter, seed, &format)?;
        }
        Commands::Serve {
            listen,
            token,
            no_echo,
        } => {
            commands::serve::run(listen, token, !no_echo)?;
        }
        Commands::Watch {
            config,
            endpoint,
            token,
        } => {
            commands::watch::run(config.as_deref(), endpoint, token)?;
        }
        Commands::Version => {
            println!("fleetsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("fleetsync protocol v{}", fleetsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
