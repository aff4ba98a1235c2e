//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Cubo - device connectivity runtime and local event tooling.
#[derive(Parser)]
#[command(name = "cubo")]
#[command(version)]
#[command(about = "Cubo device connectivity runtime and local collector tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device runtime (broker session, telemetry, local reporter)
    Start(StartArgs),

    /// Receive local event datagrams and append them to a JSONL log
    Collect(CollectArgs),

    /// Summarize sessions from a collector log
    Report(ReportArgs),

    /// Play scripted game sessions through the local reporter
    Simulate(SimulateArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/cubo.toml")]
    pub config: PathBuf,

    /// Do not read operator commands from stdin
    #[arg(long)]
    pub no_console: bool,
}

// -----------------------------------------------------------------------------
// Collector commands
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct CollectArgs {
    /// UDP address to listen on
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// JSONL file receiving one line per datagram
    #[arg(long, default_value = "logs/udp_log.jsonl")]
    pub out: PathBuf,

    /// Log level filter
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Collector log to summarize
    #[arg(long, default_value = "logs/udp_log.jsonl")]
    pub log: PathBuf,

    /// Emit one JSON object per session instead of a table
    #[arg(long)]
    pub json: bool,
}

// -----------------------------------------------------------------------------
// Simulate command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Rounds played per session
    #[arg(long, default_value_t = 3)]
    pub rounds: u32,

    /// Sessions to play
    #[arg(long, default_value_t = 1)]
    pub sessions: u32,

    /// Game mode reported in every record
    #[arg(long, default_value = "NIVEL 1")]
    pub mode: String,

    /// Simulated duration of each round in milliseconds
    #[arg(long, default_value_t = 800)]
    pub round_ms: u64,

    /// Every Nth round fails (0 disables failures)
    #[arg(long, default_value_t = 0)]
    pub fail_every: u32,

    /// Operator name applied before playing
    #[arg(long)]
    pub user: Option<String>,

    /// Keep the broker session disabled regardless of config
    #[arg(long)]
    pub offline: bool,
}
