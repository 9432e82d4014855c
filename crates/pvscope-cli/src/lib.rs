//! pvscope CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pvscope_common::telemetry::LogFormat;

/// pvscope - grow StatefulSet volume claims online
#[derive(Parser, Debug)]
#[command(name = "pvscope")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ~/.pvscope/config.json)
    #[arg(long, global = true, env = "PVSCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding migration checkpoints (defaults to ~/.pvscope/checkpoints)
    #[arg(long, global = true, env = "PVSCOPE_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Plain, env = "PVSCOPE_LOG_FORMAT")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    Plain,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Plain => LogFormat::Plain,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resize a claim by migrating it onto a new, larger volume
    Migrate(commands::migrate::MigrateArgs),
    /// Show the checkpoint of an unfinished migration
    Status(commands::ClaimArgs),
    /// Drop the checkpoint of an unfinished migration
    Forget(commands::ClaimArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let file = config::load_config(self.config.as_deref())?;
        let checkpoint_dir = config::checkpoint_dir(self.checkpoint_dir.as_deref(), &file)?;

        match self.command {
            Commands::Migrate(args) => commands::migrate::run(args, &file, checkpoint_dir).await,
            Commands::Status(args) => commands::status::run(args, checkpoint_dir).await,
            Commands::Forget(args) => commands::forget::run(args, checkpoint_dir).await,
        }
    }
}
