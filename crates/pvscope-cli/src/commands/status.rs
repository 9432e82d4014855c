//! `pvscope status`: show where an unfinished migration stopped.

use std::path::PathBuf;

use pvscope_migrate::{Checkpoint, CheckpointStore, FileCheckpointStore};

use super::ClaimArgs;
use crate::Result;

/// Run the status command.
pub async fn run(args: ClaimArgs, checkpoint_dir: PathBuf) -> Result<()> {
    let store = FileCheckpointStore::new(checkpoint_dir);
    match store.load(&args.namespace, &args.pvc).await? {
        Some(checkpoint) => {
            eprintln!("{}", summary(&checkpoint));
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        None => eprintln!(
            "No unfinished migration for {}/{}.",
            args.namespace, args.pvc
        ),
    }
    Ok(())
}

/// One-line description of a checkpoint
pub fn summary(checkpoint: &Checkpoint) -> String {
    let mut line = format!(
        "{}/{} -> {}: next step {} (updated {})",
        checkpoint.namespace(),
        checkpoint.claim_name(),
        checkpoint.state.request.target_size,
        checkpoint.next_step,
        checkpoint.updated_at.to_rfc3339(),
    );
    if let Some(error) = &checkpoint.last_error {
        line.push_str(&format!("; last run failed: {}", error));
    }
    line
}
