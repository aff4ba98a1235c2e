//! Cubo - unified CLI entrypoint.
//!
//! Usage:
//!   cubo start --config config/cubo.toml
//!   cubo collect --bind 0.0.0.0:5000 --out logs/udp_log.jsonl
//!   cubo report --log logs/udp_log.jsonl
//!   cubo simulate --rounds 5 --offline

use anyhow::Result;
use clap::Parser;
use cubo::cli::commands::{run_collect, run_report, run_simulate, run_start};
use cubo::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Collect(args) => run_collect(args).await,
        Commands::Report(args) => run_report(args),
        Commands::Simulate(args) => run_simulate(args).await,
    }
}
