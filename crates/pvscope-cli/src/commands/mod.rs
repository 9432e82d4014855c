//! CLI commands

use clap::Args;

pub mod forget;
pub mod migrate;
pub mod status;

/// Identifies the claim a command acts on
#[derive(Args, Debug, Clone)]
pub struct ClaimArgs {
    /// Namespace of the claim
    #[arg(long, short = 'n', env = "PVSCOPE_NAMESPACE")]
    pub namespace: String,

    /// Name of the PersistentVolumeClaim
    #[arg(long)]
    pub pvc: String,
}
