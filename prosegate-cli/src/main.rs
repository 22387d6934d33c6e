//! Prosegate CLI: operator interface for the Prosegate engine.
//!
//! Inspects and recomputes the learned weights, asks the advisor for
//! parameters, runs contamination sweeps and lists stored attempts.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use commands::Context;

/// Prosegate: feedback-controlled text generation
#[derive(Parser, Debug)]
#[command(name = "prosegate", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Result store (SQLite) path, overriding `store.path`
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect and recompute the composite-score weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
    /// Recommend generation parameters for a subject/component pair
    Recommend {
        /// Subject key, e.g. a material name
        #[arg(short, long)]
        subject: String,
        /// Component type, e.g. "description"
        #[arg(short = 'k', long)]
        component: String,
    },
    /// Re-run contamination classification over the qualifying corpus
    Sweep,
    /// List stored attempts, including excluded ones
    Audit {
        /// Only attempts for this subject
        #[arg(short, long)]
        subject: Option<String>,
        /// Only excluded attempts
        #[arg(long)]
        excluded_only: bool,
        /// Show at most this many (newest last)
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a complete, commented configuration file
    Init {
        /// Where to write it
        #[arg(default_value = "prosegate.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration, then print it
    Check,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum WeightsAction {
    /// Show the active weight vector
    Show,
    /// Recompute from all qualifying history and publish
    Recompute,
    /// Show previously published vectors, newest first
    History {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Recompute periodically until interrupted
    Watch {
        /// Seconds between recomputations
        #[arg(short, long, default_value = "300")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,prosegate=info,prosegate_core=info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        );

    let log_dir = directories::ProjectDirs::from("dev", "prosegate", "prosegate")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "prosegate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let ctx = Context {
        config_path: cli.config,
        store_path: cli.store,
        json: cli.json,
    };
    commands::handle_command(cli.command, &ctx).await
}
