//! Collect command - local UDP collector.

use crate::cli::args::CollectArgs;
use crate::collector::Collector;
use crate::telemetry;
use anyhow::Result;
use tokio::sync::watch;

pub async fn run_collect(args: CollectArgs) -> Result<()> {
    telemetry::init_tracing(args.log_level.as_deref())?;
    let collector = Collector::bind(args.bind, &args.out).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });
    collector.run(shutdown_rx).await?;
    Ok(())
}
