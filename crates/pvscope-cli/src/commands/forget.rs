//! `pvscope forget`: discard the checkpoint of an unfinished migration.
//!
//! Only the local record is removed; cluster objects are left as they are.
//! Use after finishing or reversing an aborted migration by hand.

use std::path::PathBuf;

use tracing::info;

use pvscope_migrate::{CheckpointStore, FileCheckpointStore};

use super::ClaimArgs;
use crate::Result;

/// Run the forget command.
pub async fn run(args: ClaimArgs, checkpoint_dir: PathBuf) -> Result<()> {
    let store = FileCheckpointStore::new(checkpoint_dir);
    match store.load(&args.namespace, &args.pvc).await? {
        Some(checkpoint) => {
            store.clear(&args.namespace, &args.pvc).await?;
            info!(
                namespace = %args.namespace,
                claim = %args.pvc,
                step = %checkpoint.next_step,
                "checkpoint removed"
            );
            eprintln!(
                "Forgot migration of {}/{} (was at step {}).",
                args.namespace, args.pvc, checkpoint.next_step
            );
        }
        None => eprintln!(
            "No unfinished migration for {}/{}.",
            args.namespace, args.pvc
        ),
    }
    Ok(())
}
