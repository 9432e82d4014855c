//! pvscope CLI
//!
//! Grows StatefulSet volume claims by migrating them onto larger volumes.

use clap::Parser;

use pvscope_cli::{Cli, Result};
use pvscope_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        default_filter: None,
    })?;

    cli.run().await
}
