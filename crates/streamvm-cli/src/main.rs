//! StreamVM CLI - Stream layout inspection and pipeline runs.
//!
//! # Commands
//!
//! - `streamvm streams` - Show the streams a resource description provisions
//! - `streamvm run` - Run a produce/transform/consume actor pipeline
//!
//! # Examples
//!
//! ```bash
//! # Streams for two CPU workers and one accelerator
//! streamvm streams --cpu 2 --gpu 1
//!
//! # Push 100 items through the pipeline, transform on the accelerator
//! streamvm run --items 100 --gpu 1 --format json
//!
//! # Start from a configuration file
//! streamvm run --config streamvm.toml
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;

use commands::{run, streams};

/// StreamVM CLI - instruction VM over heterogeneous execution streams
#[derive(Parser)]
#[command(name = "streamvm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// TOML file with a VM configuration
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the streams each stream type provisions
    Streams {
        /// CPU worker count
        #[arg(long)]
        cpu: Option<usize>,

        /// Accelerator device count
        #[arg(long)]
        gpu: Option<usize>,

        /// Network worker count
        #[arg(long)]
        net: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a produce/transform/consume pipeline
    Run {
        /// Number of items to produce
        #[arg(short, long, default_value = "16")]
        items: u64,

        /// Multiplier applied by the transform stage
        #[arg(long, default_value = "10")]
        factor: u64,

        /// Slots per register
        #[arg(long, default_value = "1")]
        slots: usize,

        /// Accelerator device count (transform runs on gpu-compute:0 when > 0)
        #[arg(long)]
        gpu: Option<usize>,

        /// Maximum in-flight instructions per stream
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Streams {
            cpu,
            gpu,
            net,
            format,
        } => streams::execute(config, cpu, gpu, net, &format).await,

        Commands::Run {
            items,
            factor,
            slots,
            gpu,
            max_in_flight,
            format,
        } => {
            let options = run::RunOptions {
                items,
                factor,
                slots,
                gpu,
                max_in_flight,
            };
            run::execute(config, options, &format).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
