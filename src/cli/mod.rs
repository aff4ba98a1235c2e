//! Cubo CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `cubo start` - Run the device runtime
//! - `cubo collect` - Local UDP collector writing JSONL
//! - `cubo report` - Per-session summaries from a collector log
//! - `cubo simulate` - Scripted sessions through the local reporter

mod args;
pub mod commands;

pub use args::{CollectArgs, Cli, Commands, ReportArgs, SimulateArgs, StartArgs};
