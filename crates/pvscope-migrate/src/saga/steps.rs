//! The ten resize-and-rebind steps
//!
//! Every step must be safe to run again after a crash or a failed attempt:
//! the runner retries a step from the last checkpoint, and a restarted
//! process resumes at the first step that has not completed.

use futures::future::BoxFuture;
use tracing::info;

use pvscope_common::Error;

use crate::copy;
use crate::scale;
use crate::volume;

use super::state::{MigrationState, SagaStep};
use super::Migrator;

type StepResult<'a> = BoxFuture<'a, Result<MigrationState, Error>>;

/// Read the original claim; it must be bound
pub(crate) fn fetch(m: &Migrator, mut state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let request = &state.request;
        let original =
            volume::get_claim(m.client(), &request.namespace, &request.claim_name).await?;
        original.bound_volume()?;

        info!(
            namespace = %original.namespace,
            claim = %original.name,
            volume = original.bound_volume_name.as_deref().unwrap_or_default(),
            size = original.requested_size.as_deref().unwrap_or_default(),
            "fetched original claim"
        );
        state.original = Some(original);
        Ok(state)
    })
}

/// Keep the original volume when its claim is deleted, remembering its policy
pub(crate) fn protect(m: &Migrator, mut state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let volume_name = state.original()?.bound_volume()?.to_string();
        let previous = volume::ensure_retain(
            m.client(),
            &volume_name,
            m.config().policy_poll,
            m.cancel_token(),
        )
        .await?;

        state.original_reclaim_policy.get_or_insert(previous);
        Ok(state)
    })
}

/// Create the staging claim at the target size and wait for it to bind
pub(crate) fn stage(m: &Migrator, mut state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let request = &state.request;
        let descriptor = state
            .original()?
            .staging_for(&request.target_size, request.storage_class.as_deref());

        let staging = volume::create_claim_and_await_bound(
            m.client(),
            &descriptor,
            m.config().bind_poll,
            m.cancel_token(),
        )
        .await?;
        // An existing staging claim is only reused if it is the one we would create
        if let Some(reason) = staging.mismatch_with(&descriptor) {
            return Err(Error::validation(format!(
                "claim {}/{} already exists and {}",
                staging.namespace, staging.name, reason
            )));
        }
        staging.bound_volume()?;

        state.staging = Some(staging);
        Ok(state)
    })
}

/// Keep the staging volume when the staging claim is deleted
pub(crate) fn protect_staging(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let volume_name = state.staging()?.bound_volume()?;
        volume::ensure_retain(
            m.client(),
            volume_name,
            m.config().policy_poll,
            m.cancel_token(),
        )
        .await?;
        Ok(state)
    })
}

/// Stop every writer to the original claim
pub(crate) fn quiesce(m: &Migrator, mut state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let namespace = state.request.namespace.clone();
        let workload = state.request.workload_name.clone();

        // Capture once; a retry after scaling started would read a partial count
        if state.original_replicas.is_none() {
            let replicas = scale::get_replicas(m.client(), &namespace, &workload).await?;
            info!(namespace = %namespace, workload = %workload, replicas, "captured replica count");
            state.original_replicas = Some(replicas);
            m.checkpoint(&state, SagaStep::Quiesce).await?;
        }

        scale::scale_to(
            m.client(),
            &namespace,
            &workload,
            0,
            m.config().scale_poll,
            m.cancel_token(),
        )
        .await?;
        Ok(state)
    })
}

/// Copy the original claim's data into the staging claim
pub(crate) fn copy(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        copy::run_copy(
            m.client(),
            &state.original()?.name,
            &state.staging()?.name,
            &state.request.namespace,
            &m.config().copy,
            m.cancel_token(),
        )
        .await?;
        Ok(state)
    })
}

/// Delete both claims; their volumes are kept by the Retain policy
pub(crate) fn reclaim(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let namespace = &state.request.namespace;
        for name in [&state.original()?.name, &state.staging()?.name] {
            volume::delete_claim_and_await_gone(
                m.client(),
                namespace,
                name,
                m.config().delete_poll,
                m.cancel_token(),
            )
            .await?;
        }
        Ok(state)
    })
}

/// Recreate the original claim name, bound to the staging volume
pub(crate) fn rebind(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        let request = &state.request;
        let original = state.original()?;
        let staging_volume = state.staging()?.bound_volume()?;
        let original_volume = original.bound_volume()?;
        let client = m.client();
        let cancel = m.cancel_token();

        match client.get_claim(&request.namespace, &original.name).await {
            Ok(existing) => {
                let pinned = existing.spec.and_then(|s| s.volume_name);
                if pinned.as_deref() != Some(staging_volume) {
                    return Err(Error::validation(format!(
                        "claim {}/{} was recreated outside the migration (volume {:?})",
                        request.namespace, original.name, pinned
                    )));
                }
                info!(
                    namespace = %request.namespace,
                    claim = %original.name,
                    volume = %staging_volume,
                    "claim already points at the staging volume"
                );
            }
            Err(e) if e.is_not_found() => {
                let unlink_poll = m.config().unlink_poll;
                volume::unlink(client, staging_volume, unlink_poll, cancel).await?;
                // The old volume keeps a reference to the deleted claim's name
                volume::unlink(client, original_volume, unlink_poll, cancel).await?;
            }
            Err(e) => return Err(e),
        }

        let descriptor = original.rebound_to(
            staging_volume,
            &request.target_size,
            request.storage_class.as_deref(),
        );
        volume::create_claim_and_await_bound(client, &descriptor, m.config().bind_poll, cancel)
            .await?;
        Ok(state)
    })
}

/// Give the rebound volume the reclaim policy the original volume had
pub(crate) fn restore_policy(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        volume::set_policy(
            m.client(),
            state.staging()?.bound_volume()?,
            state.original_reclaim_policy()?,
            m.config().policy_poll,
            m.cancel_token(),
        )
        .await?;
        Ok(state)
    })
}

/// Scale the workload back to its captured replica count
pub(crate) fn resume(m: &Migrator, state: MigrationState) -> StepResult<'_> {
    Box::pin(async move {
        scale::scale_to(
            m.client(),
            &state.request.namespace,
            &state.request.workload_name,
            state.original_replicas()?,
            m.config().scale_poll,
            m.cancel_token(),
        )
        .await?;
        Ok(state)
    })
}
