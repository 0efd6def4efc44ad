//! FlowMetrics collector CLI - thin wrapper around the Collector abstraction.
//!
//! Loads the configuration file, wires the pipeline and runs until
//! interrupted. All collector logic lives in the library.

use clap::Parser;
use flowmetrics::collector::Collector;
use flowmetrics::receiver::JsonDecoder;
use flowmetrics::{Config, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "flowmetrics-collector",
    version,
    about = "NetFlow-style flow collector exporting bounded-cardinality Prometheus metrics"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/collector.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!(config = %args.config, "starting flowmetrics collector");

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut collector = Collector::new(config)?;
    collector.start(Arc::new(JsonDecoder)).await?;

    signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    info!("received shutdown signal (Ctrl+C)");

    collector.stop().await;

    Ok(())
}
