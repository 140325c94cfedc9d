//! neuralfit CLI: train, predict and inspect networks on the reference backend.

mod commands;
mod dataset;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "neuralfit",
    version,
    about = "Estimator-style neural network training with weight transplantation"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train a network on a JSON dataset
    Train {
        /// Network configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset with `x` and `y` arrays (JSON)
        #[arg(short, long)]
        data: PathBuf,

        /// Where to save the trained state
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Continue training the network saved at --state
        #[arg(long, requires = "state")]
        resume: bool,

        /// Write the trained parameters to this file
        #[arg(long)]
        weights_out: Option<PathBuf>,

        /// Transplant parameters from this file before training
        #[arg(long)]
        weights_in: Option<PathBuf>,

        /// Stop once the validation loss has not improved for N epochs
        #[arg(long)]
        patience: Option<usize>,
    },
    /// Predict with a saved network
    Predict {
        /// Saved network state
        #[arg(short, long)]
        state: PathBuf,

        /// Dataset with an `x` array (JSON)
        #[arg(short, long)]
        data: PathBuf,

        /// Print class probabilities instead of labels
        #[arg(long)]
        proba: bool,
    },
    /// Print the training history of a saved network
    History {
        /// Saved network state
        #[arg(short, long)]
        state: PathBuf,
    },
    /// Print the layer table of a saved network
    Layers {
        /// Saved network state
        #[arg(short, long)]
        state: PathBuf,

        /// Include receptive fields and capacity for conv layers
        #[arg(long)]
        detailed: bool,
    },
    /// Show which parameters would be transplanted between two networks
    Align {
        /// Source weights file
        #[arg(long, conflicts_with = "source_shapes")]
        source: Option<PathBuf>,

        /// Target weights file
        #[arg(long, conflicts_with = "target_shapes")]
        target: Option<PathBuf>,

        /// Source shapes, e.g. `3x3,64,10`
        #[arg(long)]
        source_shapes: Option<String>,

        /// Target shapes, e.g. `3x3,64,10`
        #[arg(long)]
        target_shapes: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the resolved configuration
    Show {
        /// Network configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "neuralfit", "neuralfit")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "neuralfit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command).await
}
