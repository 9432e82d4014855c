//! Volume lifecycle operations
//!
//! Each operation applies one change and then waits until the change is
//! observed on the cluster. Deletes and creates are idempotent: an absent
//! claim counts as deleted and an existing claim counts as created, so a
//! step can be replayed after a crash between the write and the wait.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::PersistentVolume;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pvscope_common::retry::{retry_with_backoff_if, RetryConfig};
use pvscope_common::{poll_until, Error, PollSpec};

use crate::claim::{ClaimDescriptor, PHASE_BOUND};
use crate::client::ClusterClient;

/// Default wait for a reclaim-policy change to be observed
pub const POLICY_POLL: PollSpec = PollSpec::secs(2, 120);
/// Default wait for a volume's claim reference to clear
pub const UNLINK_POLL: PollSpec = PollSpec::secs(2, 120);
/// Default wait for a new claim to bind
pub const BIND_POLL: PollSpec = PollSpec::secs(2, 120);
/// Default wait for a deleted claim to disappear
pub const DELETE_POLL: PollSpec = PollSpec::secs(1, 120);

/// Annotation recording the reclaim policy a volume had before it was set to Retain
pub const ORIGINAL_POLICY_ANNOTATION: &str = "pvscope.io/original-reclaim-policy";

/// What happens to a volume when its bound claim is deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    /// Volume and backing storage are deleted
    Delete,
    /// Volume is kept and becomes Released
    Retain,
    /// Volume is scrubbed and made Available again
    Recycle,
}

impl ReclaimPolicy {
    /// API string for the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Recycle => "Recycle",
        }
    }

    /// Policy of a volume; unset means the API server default, Retain
    pub fn of(volume: &PersistentVolume) -> Result<Self, Error> {
        volume
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            .map(str::parse)
            .unwrap_or(Ok(ReclaimPolicy::Retain))
    }
}

impl fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            other => Err(Error::validation(format!("unknown reclaim policy {:?}", other))),
        }
    }
}

/// Volume identity plus its reclaim policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRef {
    /// Cluster-assigned volume name
    pub name: String,
    /// Current reclaim policy
    pub reclaim_policy: ReclaimPolicy,
}

impl VolumeRef {
    /// Read the identity and policy of a volume object
    pub fn from_volume(volume: &PersistentVolume) -> Result<Self, Error> {
        Ok(Self {
            name: volume
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::validation("volume has no name"))?,
            reclaim_policy: ReclaimPolicy::of(volume)?,
        })
    }
}

/// What a read-modify-write decided after inspecting the freshly read volume
enum Edit<R> {
    /// Replace the volume with the mutated copy
    Write(R),
    /// Leave the volume as it is
    Skip(R),
}

/// Read-modify-write a volume, re-reading on conflicting concurrent writes
///
/// `mutate` sees the volume as read on each attempt, so anything it derives
/// from the volume is never older than the write it goes into.
async fn update_volume<F, R>(
    client: &dyn ClusterClient,
    name: &str,
    cancel: &CancellationToken,
    mutate: F,
) -> Result<Edit<R>, Error>
where
    F: Fn(&mut PersistentVolume) -> Result<Edit<R>, Error>,
{
    let mutate = &mutate;
    retry_with_backoff_if(
        &RetryConfig::conflict(),
        "update_volume",
        cancel,
        Error::is_conflict,
        || async move {
            let mut volume = client.get_volume(name).await?;
            let edit = mutate(&mut volume)?;
            if let Edit::Write(_) = edit {
                client.replace_volume(&volume).await?;
            }
            Ok(edit)
        },
    )
    .await
}

/// Policy recorded by an earlier `ensure_retain`, if any
fn recorded_policy(volume: &PersistentVolume) -> Result<Option<ReclaimPolicy>, Error> {
    volume
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ORIGINAL_POLICY_ANNOTATION))
        .map(|p| p.parse::<ReclaimPolicy>())
        .transpose()
}

fn set_policy_field(volume: &mut PersistentVolume, policy: ReclaimPolicy) {
    volume
        .spec
        .get_or_insert_with(Default::default)
        .persistent_volume_reclaim_policy = Some(policy.to_string());
}

async fn await_policy(
    client: &dyn ClusterClient,
    name: &str,
    policy: ReclaimPolicy,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let what = format!("volume {} reclaim policy {}", name, policy);
    poll_until(spec, &what, cancel, || async move {
        let volume = client.get_volume(name).await?;
        Ok(ReclaimPolicy::of(&volume)? == policy)
    })
    .await
}

/// Make sure a volume survives deletion of its claim
///
/// Returns the policy the volume had before this tool first protected it.
/// A volume that is already Retain is left untouched; if it carries the
/// original-policy annotation from an earlier run, that value is returned.
pub async fn ensure_retain(
    client: &dyn ClusterClient,
    name: &str,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<ReclaimPolicy, Error> {
    let edit = update_volume(client, name, cancel, |volume| {
        let current = ReclaimPolicy::of(volume)?;
        if current == ReclaimPolicy::Retain {
            return Ok(Edit::Skip(
                recorded_policy(volume)?.unwrap_or(ReclaimPolicy::Retain),
            ));
        }
        set_policy_field(volume, ReclaimPolicy::Retain);
        volume
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ORIGINAL_POLICY_ANNOTATION.to_string(), current.to_string());
        Ok(Edit::Write(current))
    })
    .await?;

    match edit {
        Edit::Skip(recorded) => {
            debug!(volume = %name, recorded = %recorded, "volume already retained");
            Ok(recorded)
        }
        Edit::Write(previous) => {
            info!(volume = %name, previous = %previous, "reclaim policy set to Retain");
            await_policy(client, name, ReclaimPolicy::Retain, spec, cancel).await?;
            Ok(previous)
        }
    }
}

/// Apply a reclaim policy and wait until it is observed
///
/// Also drops the original-policy annotation: once a policy is set
/// explicitly the recorded value no longer describes the volume.
pub async fn set_policy(
    client: &dyn ClusterClient,
    name: &str,
    policy: ReclaimPolicy,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    info!(volume = %name, policy = %policy, "setting reclaim policy");
    update_volume(client, name, cancel, |volume| {
        set_policy_field(volume, policy);
        if let Some(annotations) = volume.metadata.annotations.as_mut() {
            annotations.remove(ORIGINAL_POLICY_ANNOTATION);
        }
        Ok(Edit::Write(()))
    })
    .await?;

    await_policy(client, name, policy, spec, cancel).await
}

/// Clear a volume's claim reference so it can bind to a different claim
pub async fn unlink(
    client: &dyn ClusterClient,
    name: &str,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    info!(volume = %name, "clearing claim reference");
    update_volume(client, name, cancel, |volume| {
        if let Some(s) = volume.spec.as_mut() {
            s.claim_ref = None;
        }
        Ok(Edit::Write(()))
    })
    .await?;

    let what = format!("volume {} claim reference cleared", name);
    poll_until(spec, &what, cancel, || async move {
        let volume = client.get_volume(name).await?;
        Ok(volume.spec.and_then(|s| s.claim_ref).is_none())
    })
    .await
}

/// Fetch the descriptor of a live claim
pub async fn get_claim(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<ClaimDescriptor, Error> {
    ClaimDescriptor::from_claim(&client.get_claim(namespace, name).await?)
}

/// Create a claim and wait for it to bind
///
/// An existing claim with the same name counts as created. Returns the
/// descriptor of the bound claim, carrying the volume it bound to.
pub async fn create_claim_and_await_bound(
    client: &dyn ClusterClient,
    descriptor: &ClaimDescriptor,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<ClaimDescriptor, Error> {
    let namespace = descriptor.namespace.as_str();
    let name = descriptor.name.as_str();

    match client.create_claim(namespace, &descriptor.to_claim()).await {
        Ok(_) => info!(namespace = %namespace, claim = %name, "claim created"),
        Err(e) if e.is_already_exists() => {
            info!(namespace = %namespace, claim = %name, "claim already exists")
        }
        Err(e) => return Err(e),
    }

    let what = format!("claim {}/{} bound", namespace, name);
    let waited = poll_until(spec, &what, cancel, || async move {
        match client.get_claim(namespace, name).await {
            Ok(claim) => Ok(claim.status.and_then(|s| s.phase).as_deref() == Some(PHASE_BOUND)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    })
    .await;

    match waited {
        Err(Error::Timeout { seconds, .. }) => {
            return Err(Error::BindTimeout {
                claim: name.to_string(),
                seconds,
            })
        }
        other => other?,
    }

    let bound = get_claim(client, namespace, name).await?;
    info!(
        namespace = %namespace,
        claim = %name,
        volume = bound.bound_volume_name.as_deref().unwrap_or_default(),
        "claim bound"
    );
    Ok(bound)
}

/// Delete a claim and wait until it is gone
///
/// A claim that is already absent counts as deleted.
pub async fn delete_claim_and_await_gone(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    match client.delete_claim(namespace, name).await {
        Ok(()) => info!(namespace = %namespace, claim = %name, "claim deleted"),
        Err(e) if e.is_not_found() => {
            debug!(namespace = %namespace, claim = %name, "claim already deleted");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let what = format!("claim {}/{} removed", namespace, name);
    poll_until(spec, &what, cancel, || async move {
        match client.get_claim(namespace, name).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    })
    .await
}
