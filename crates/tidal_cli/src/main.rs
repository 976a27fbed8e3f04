//! Tidal CLI
//!
//! Command-line tools for exercising the Tidal sync client.
//!
//! # Commands
//!
//! - `simulate` - Run a client against an in-process backend
//! - `gc` - Run one LRU collection pass over a generated cache
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Tidal sync client tools.
#[derive(Parser)]
#[command(name = "tidal")]
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
    /// Run a client against an in-process backend and print what the sync
    /// layer receives
    Simulate {
        /// Collection to listen to
        #[arg(short, long, default_value = "rooms")]
        collection: String,

        /// Documents present before listening
        #[arg(short, long, default_value = "3")]
        documents: usize,

        /// Documents written while listening
        #[arg(short, long, default_value = "2")]
        writes: usize,

        /// Also listen to this path and have the backend reject it
        #[arg(long)]
        deny: Option<String>,

        /// Make the backend unreachable for this many milliseconds
        #[arg(long)]
        outage_ms: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run one LRU collection pass over a generated cache
    Gc {
        /// Number of targets to cache
        #[arg(short, long, default_value = "10")]
        targets: usize,

        /// Documents cached per target
        #[arg(short, long, default_value = "5")]
        documents_per_target: usize,

        /// How many of the oldest targets to release
        #[arg(short, long, default_value = "5")]
        released: usize,

        /// Percentile of sequence numbers to collect
        #[arg(short, long, default_value = "50")]
        percentile: u32,

        /// Cache size in bytes below which collection is skipped
        #[arg(long, default_value = "0")]
        threshold: i64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            collection,
            documents,
            writes,
            deny,
            outage_ms,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                collection,
                documents,
                writes,
                deny,
                outage: outage_ms.map(Duration::from_millis),
            };
            commands::simulate::run(options, &format)?;
        }
        Commands::Gc {
            targets,
            documents_per_target,
            released,
            percentile,
            threshold,
            format,
        } => {
            let options = commands::gc::GcOptions {
                targets,
                documents_per_target,
                released,
                percentile,
                threshold,
            };
            commands::gc::run(&options, &format)?;
        }
        Commands::Version => {
            println!("Tidal CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Tidal Sync Engine v{}", tidal_sync_engine::VERSION);
        }
    }

    Ok(())
}
