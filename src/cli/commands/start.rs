//! Start command - launches the device runtime.

use crate::cli::args::StartArgs;
use crate::config::Config;
use crate::runtime::Runtime;
use crate::telemetry;
use crate::time::SystemClock;
use anyhow::Result;
use std::env;

pub async fn run_start(args: StartArgs) -> Result<()> {
    // Set config path via environment so Config::load_from_env picks it up
    env::set_var("CUBO_CONFIG", args.config.display().to_string());

    let config = Config::load_from_env()?;
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let mut runtime = Runtime::start(config, SystemClock, Some(log_handle)).await?;
    if !args.no_console {
        runtime.attach_console();
    }
    runtime.run_until_signal().await
}
