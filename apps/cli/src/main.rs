//! modelfetch CLI - resumable model artifact downloader
//!
//! Downloads large artifacts over HTTP(S), persists resume state on
//! pause or Ctrl-C, and picks up where it left off on the next run.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// modelfetch - resumable model artifact downloads
#[derive(Parser)]
#[command(name = "modelfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for resume state
    #[arg(long, env = "MODELFETCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an artifact, resuming from persisted state when possible
    Get {
        /// URL to download
        url: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Discard persisted resume state and start over
        #[arg(long)]
        fresh: bool,
    },

    /// Show the persisted resume state
    Status,

    /// Drop persisted resume state and partial data
    Clear,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("modelfetch"))
            .unwrap_or_else(|| PathBuf::from(".modelfetch"))
    });

    match cli.command {
        Commands::Get { url, output, fresh } => {
            commands::get(data_dir, &url, output, fresh, cli.output).await?
        }

        Commands::Status => commands::status(data_dir, cli.output).await?,

        Commands::Clear => commands::clear(data_dir, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "modelfetch",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}
