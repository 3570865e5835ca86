//! RagProbe CLI: terminal front end for the retrieval-evaluation pipeline.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// RagProbe: probe and score a RAG answering service
#[derive(Parser, Debug)]
#[command(name = "ragprobe", version, about, long_about = None)]
struct Cli {
    /// Workspace directory holding `.ragprobe/config.toml` and the data dir
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline: questions, retrieval, evaluation
    Run {
        /// Questions CSV (defaults to `<data_dir>/questions.csv`)
        #[arg(long)]
        questions: Option<PathBuf>,

        /// Prior run's retrieval CSV; questions already answered there are not re-sent
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Skip LLM judge scoring even when configured
        #[arg(long)]
        no_judge: bool,

        /// Override the number of concurrent retrieval workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override the per-worker delay between requests, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Stream raw progress events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Evaluate an existing retrieval artifact without re-running retrieval
    Evaluate {
        /// Retrieval CSV to evaluate (defaults to the latest run's)
        #[arg(long)]
        retrieval: Option<PathBuf>,

        /// Skip LLM judge scoring even when configured
        #[arg(long)]
        no_judge: bool,

        /// Stream raw progress events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the latest run's summary
    Summary,
    /// List persisted runs, newest first
    Runs,
    /// List the question categories and what each probes
    Categories,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective layered configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // Logs go to stderr so JSON event streaming on stdout stays clean.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry().with(stderr_layer).init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
