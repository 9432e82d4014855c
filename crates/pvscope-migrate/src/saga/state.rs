//! Migration request, accumulated state, and step identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

use pvscope_common::Error;

use crate::claim::{validate_claim_name, validate_size, ClaimDescriptor};
use crate::volume::ReclaimPolicy;

/// What to migrate and where to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    /// Namespace of the claim and workload
    pub namespace: String,
    /// Claim to resize
    pub claim_name: String,
    /// Target storage quantity, e.g. `5Gi`
    pub target_size: String,
    /// StatefulSet mounting the claim
    pub workload_name: String,
    /// Storage class for the new volume; defaults to the claim's current class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl MigrationRequest {
    /// Create a request without a storage-class change
    pub fn new(
        namespace: impl Into<String>,
        claim_name: impl Into<String>,
        target_size: impl Into<String>,
        workload_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            claim_name: claim_name.into(),
            target_size: target_size.into(),
            workload_name: workload_name.into(),
            storage_class: None,
        }
    }

    /// Move the claim to a different storage class
    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    /// Reject requests that cannot succeed before touching the cluster
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.workload_name.is_empty() {
            return Err(Error::validation("workload name must not be empty"));
        }
        if matches!(self.storage_class.as_deref(), Some("")) {
            return Err(Error::validation("storage class must not be empty"));
        }
        validate_claim_name(&self.claim_name)?;
        validate_size(&self.target_size)
    }
}

/// Everything the saga has learned so far
///
/// Each step fills in the fields the later steps consume; a step that finds
/// its input missing fails with `MissingState`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// The request being served
    pub request: MigrationRequest,
    /// Original claim as fetched before any change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<ClaimDescriptor>,
    /// Staging claim once it has bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging: Option<ClaimDescriptor>,
    /// Reclaim policy the original volume had before it was protected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_reclaim_policy: Option<ReclaimPolicy>,
    /// Workload replica count before it was quiesced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_replicas: Option<i32>,
}

impl MigrationState {
    /// Fresh state for a request
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            request,
            original: None,
            staging: None,
            original_reclaim_policy: None,
            original_replicas: None,
        }
    }

    /// Original claim, or `MissingState` before Fetch
    pub fn original(&self) -> Result<&ClaimDescriptor, Error> {
        self.original
            .as_ref()
            .ok_or_else(|| Error::missing_state("original"))
    }

    /// Staging claim, or `MissingState` before Stage
    pub fn staging(&self) -> Result<&ClaimDescriptor, Error> {
        self.staging
            .as_ref()
            .ok_or_else(|| Error::missing_state("staging"))
    }

    /// Captured original-volume policy, or `MissingState` before Protect
    pub fn original_reclaim_policy(&self) -> Result<ReclaimPolicy, Error> {
        self.original_reclaim_policy
            .ok_or_else(|| Error::missing_state("originalReclaimPolicy"))
    }

    /// Captured replica count, or `MissingState` before Quiesce
    pub fn original_replicas(&self) -> Result<i32, Error> {
        self.original_replicas
            .ok_or_else(|| Error::missing_state("originalReplicas"))
    }
}

/// Saga steps in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SagaStep {
    /// Read the original claim
    Fetch,
    /// Set the original volume to Retain, capturing its policy
    Protect,
    /// Create the staging claim at the target size
    Stage,
    /// Set the staging volume to Retain
    ProtectStaging,
    /// Scale the workload to zero
    Quiesce,
    /// Copy original into staging
    Copy,
    /// Delete the original and staging claims
    Reclaim,
    /// Recreate the original claim name on the staging volume
    Rebind,
    /// Give the rebound volume the original volume's policy
    RestorePolicy,
    /// Scale the workload back up
    Resume,
}

impl SagaStep {
    /// Every step, in execution order
    pub const ALL: [SagaStep; 10] = [
        SagaStep::Fetch,
        SagaStep::Protect,
        SagaStep::Stage,
        SagaStep::ProtectStaging,
        SagaStep::Quiesce,
        SagaStep::Copy,
        SagaStep::Reclaim,
        SagaStep::Rebind,
        SagaStep::RestorePolicy,
        SagaStep::Resume,
    ];

    /// Stable name used in logs, events, and checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            SagaStep::Fetch => "fetch",
            SagaStep::Protect => "protect",
            SagaStep::Stage => "stage",
            SagaStep::ProtectStaging => "protect-staging",
            SagaStep::Quiesce => "quiesce",
            SagaStep::Copy => "copy",
            SagaStep::Reclaim => "reclaim",
            SagaStep::Rebind => "rebind",
            SagaStep::RestorePolicy => "restore-policy",
            SagaStep::Resume => "resume",
        }
    }

    /// The step after this one, or `None` after the last
    pub fn next(&self) -> Option<SagaStep> {
        let index = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(index + 1).copied()
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
