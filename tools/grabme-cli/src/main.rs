//! GrabMe CLI: export recordings through the frame pipeline.
//!
//! Usage:
//!   grabme export <INPUT> [OPTIONS]   Render a recording to video
//!   grabme probe <INPUT>              Show container and codec details
//!   grabme synth <OUTPUT>             Write a synthetic raw-video MP4
//!   grabme check                      Check external tools and config

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use grabme_common::config::ExportConfigFile;

mod commands;

#[derive(Parser)]
#[command(
    name = "grabme",
    about = "Screen recording export pipeline",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Export config file (defaults to $XDG_CONFIG_HOME/grabme/export.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a recording to video
    Export(commands::export::ExportArgs),

    /// Show container and codec details of a recording
    Probe {
        /// Recording to inspect
        input: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a synthetic raw-video MP4 (moving square on a gradient)
    Synth {
        /// Output file path
        output: PathBuf,

        #[arg(long, default_value = "320")]
        width: u32,

        #[arg(long, default_value = "240")]
        height: u32,

        #[arg(long, default_value = "30")]
        fps: u32,

        /// Length in seconds
        #[arg(long, default_value = "2.0")]
        seconds: f64,
    },

    /// Check external tools, decoders, and the config file
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ExportConfigFile::load_from(path),
        None => ExportConfigFile::load(),
    };

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json |= cli.json_logs;
    grabme_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Export(args) => commands::export::run(args, &config).await,
        Commands::Probe { input, json } => commands::probe::run(input, json).await,
        Commands::Synth {
            output,
            width,
            height,
            fps,
            seconds,
        } => commands::synth::run(output, width, height, fps, seconds),
        Commands::Check => commands::check::run(&config, cli.config.as_deref()),
    }
}
