//! Online resize-and-rebind migration for StatefulSet volume claims
//!
//! Grows a bound PersistentVolumeClaim by provisioning a staging claim at the
//! target size, copying the data with a sync Job while the workload is scaled
//! down, and re-creating the original claim name on the new volume.
//!
//! ```text
//! Fetch -> Protect -> Stage -> ProtectStaging -> Quiesce -> Copy
//!       -> Reclaim -> Rebind -> RestorePolicy -> Resume
//! ```

#![deny(missing_docs)]

pub mod claim;
pub mod client;
pub mod config;
pub mod copy;
pub mod events;
pub mod saga;
pub mod scale;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use claim::ClaimDescriptor;
pub use client::{ClusterClient, KubeClusterClient};
pub use config::MigrateConfig;
pub use copy::{CopyConfig, CopyJobSpec};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use saga::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MigrationRequest,
    MigrationState, Migrator, MigratorBuilder, SagaError, SagaStep, StepRegistry,
};
pub use volume::{ReclaimPolicy, VolumeRef};
