//! Durable saga progress
//!
//! A checkpoint is written before every step. If the process dies, the next
//! run for the same claim starts from `next_step` with the saved state,
//! relying on every step being safe to repeat.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pvscope_common::Error;

use super::state::{MigrationState, SagaStep};

/// Saved progress of one migration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// State accumulated by the completed steps
    pub state: MigrationState,
    /// First step still to run
    pub next_step: SagaStep,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
    /// Error that aborted the last run, if it aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Checkpoint {
    /// Checkpoint taken now
    pub fn new(state: MigrationState, next_step: SagaStep) -> Self {
        Self {
            state,
            next_step,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    /// Namespace of the migrated claim
    pub fn namespace(&self) -> &str {
        &self.state.request.namespace
    }

    /// Name of the migrated claim
    pub fn claim_name(&self) -> &str {
        &self.state.request.claim_name
    }
}

/// Where checkpoints are kept, keyed by namespace and claim name
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a claim, if one exists
    async fn load(&self, namespace: &str, claim: &str) -> Result<Option<Checkpoint>, Error>;

    /// Save a checkpoint, replacing any previous one for the same claim
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error>;

    /// Remove the checkpoint for a claim; absent is not an error
    async fn clear(&self, namespace: &str, claim: &str) -> Result<(), Error>;
}

/// One JSON file per claim under a directory
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoint files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str, claim: &str) -> PathBuf {
        // Namespaces and claim names are DNS names and cannot contain '_'
        self.dir.join(format!("{}_{}.json", namespace, claim))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::checkpoint(format!("failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, namespace: &str, claim: &str) -> Result<Option<Checkpoint>, Error> {
        let path = self.path_for(namespace, claim);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create", &self.dir, e))?;

        let path = self.path_for(checkpoint.namespace(), checkpoint.claim_name());
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        // Write then rename so a crash never leaves a truncated checkpoint
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))?;

        debug!(path = %path.display(), next_step = %checkpoint.next_step, "checkpoint saved");
        Ok(())
    }

    async fn clear(&self, namespace: &str, claim: &str) -> Result<(), Error> {
        let path = self.path_for(namespace, claim);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

/// In-process store; checkpoints are lost when the process exits
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, namespace: &str, claim: &str) -> Result<Option<Checkpoint>, Error> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), claim.to_string()))
            .cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        self.entries.lock().insert(
            (
                checkpoint.namespace().to_string(),
                checkpoint.claim_name().to_string(),
            ),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn clear(&self, namespace: &str, claim: &str) -> Result<(), Error> {
        self.entries
            .lock()
            .remove(&(namespace.to_string(), claim.to_string()));
        Ok(())
    }
}
