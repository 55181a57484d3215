//! # cwindex CLI
//!
//! Command-line interface for the cwindex contract state indexer.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cwindex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "cwindex.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter cwindex.yml
    Init {
        /// Target directory (defaults to current directory)
        path: Option<PathBuf>,
    },

    /// Ingest raw state events from a JSON lines file
    Ingest {
        /// File with one raw event per line
        events: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a formula at one block
    Query {
        /// Formula name
        formula: String,

        /// Target contract address
        target: String,

        /// Block height (defaults to the latest ingested block)
        #[arg(long)]
        block: Option<u64>,

        /// Formula arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a formula over a block range
    Range {
        /// Formula name
        formula: String,

        /// Target contract address
        target: String,

        /// First block height
        #[arg(long)]
        start: u64,

        /// Last block height (capped at the latest ingested block)
        #[arg(long)]
        end: u64,

        /// Sample the value every N blocks instead of listing changes
        #[arg(long)]
        step: Option<u64>,

        /// Formula arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the latest block and stored row counts
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => commands::init_project(path.as_deref()),
        Commands::Ingest { events, json } => commands::ingest_events(&cli.config, &events, json),
        Commands::Query {
            formula,
            target,
            block,
            args,
            json,
        } => commands::query(&cli.config, &formula, &target, block, &args, json),
        Commands::Range {
            formula,
            target,
            start,
            end,
            step,
            args,
            json,
        } => {
            let opts = commands::RangeOptions {
                start,
                end,
                step,
                json,
            };
            commands::range(&cli.config, &formula, &target, &args, opts)
        }
        Commands::Status { json } => commands::status(&cli.config, json),
    }
}
