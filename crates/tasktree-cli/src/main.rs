//! tasktree: run the simulated detector tree from the command line.
//!
//! Usage:
//!   tasktree run --batches 4 --budget 400
//!   tasktree run --config demo.toml --deadline-ms 2000 --verbose
//!
//! The run outcome is printed to stdout as JSON; diagnostics go to stderr
//! (filter with `RUST_LOG`).

mod demo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tasktree::{Orchestrator, Request, TreeShape};
use tracing::info;

use demo::{DemoConfig, DemoFactory};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the demo tree and execute one run
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Demo tree definition (TOML). The built-in demo is used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of input batches, one dispatch cycle each
    #[arg(long, default_value_t = 1)]
    batches: usize,

    /// Budget ceiling in resource units
    #[arg(long, default_value_t = 10_000)]
    budget: u64,

    /// Overall run deadline in milliseconds
    #[arg(long, default_value_t = 5_000)]
    deadline_ms: u64,

    /// Keep DEBUG entries in the aggregated logs
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run(run) => run_demo(run).await,
    }
}

async fn run_demo(args: RunArgs) -> Result<()> {
    anyhow::ensure!(args.batches > 0, "--batches must be at least 1");

    let demo = match &args.config {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };
    let mut config = demo.orchestrator_config();
    if args.verbose {
        config.verbose = true;
    }

    let factory = DemoFactory::new(demo.clone());
    let orchestrator = Orchestrator::build(&TreeShape::new(demo.branching.clone()), &factory, config)
        .context("failed to build the demo tree")?;
    info!(
        nodes = orchestrator.tree().len(),
        leaves = orchestrator.tree().leaf_count(),
        depth = orchestrator.tree().depth(),
        "Demo tree built"
    );

    let batches = (0..args.batches)
        .map(|i| json!({ "batch": i, "source": "demo" }))
        .collect();
    let request = Request::batched(batches, Duration::from_millis(args.deadline_ms), args.budget);
    let outcome = orchestrator.run(request).await;

    let rendered =
        serde_json::to_string_pretty(&outcome).context("failed to encode the run outcome")?;
    println!("{}", rendered);

    if outcome.is_fatal() {
        anyhow::bail!("run {} aborted: {}", outcome.run_id, outcome.final_status);
    }
    Ok(())
}
