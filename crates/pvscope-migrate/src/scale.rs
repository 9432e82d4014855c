//! Workload scale gate
//!
//! Scales a StatefulSet and waits until the controller reports the requested
//! number of replicas, all of them ready. Scaling to zero is how the
//! migration guarantees nothing writes to a claim while it is copied.

use k8s_openapi::api::apps::v1::StatefulSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pvscope_common::retry::{retry_with_backoff_if, RetryConfig};
use pvscope_common::{poll_until, Error, PollSpec};

use crate::client::ClusterClient;

/// Default wait for a workload to reach its target replica count
pub const SCALE_POLL: PollSpec = PollSpec::secs(5, 300);

/// Desired replica count of a workload; unset counts as zero
pub async fn get_replicas(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<i32, Error> {
    let set = client.get_stateful_set(namespace, name).await?;
    Ok(desired_replicas(&set))
}

fn desired_replicas(set: &StatefulSet) -> i32 {
    set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// True once the controller reports exactly `target` replicas, all ready
fn settled_at(set: &StatefulSet, target: i32) -> bool {
    set.status
        .as_ref()
        .map(|s| s.replicas == target && s.ready_replicas.unwrap_or(0) == target)
        .unwrap_or(target == 0)
}

/// Set a workload's replica count and wait for it to settle
pub async fn scale_to(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    replicas: i32,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    info!(namespace = %namespace, workload = %name, replicas, "scaling workload");

    retry_with_backoff_if(
        &RetryConfig::conflict(),
        "scale_workload",
        cancel,
        Error::is_conflict,
        || async move {
            let mut set = client.get_stateful_set(namespace, name).await?;
            if desired_replicas(&set) == replicas {
                return Ok(());
            }
            set.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            client
                .replace_stateful_set(namespace, &set)
                .await
                .map(|_| ())
        },
    )
    .await?;

    let what = format!("workload {}/{} at {} replicas", namespace, name, replicas);
    let waited = poll_until(spec, &what, cancel, || async move {
        let set = client.get_stateful_set(namespace, name).await?;
        Ok(settled_at(&set, replicas))
    })
    .await;

    match waited {
        Err(Error::Timeout { seconds, .. }) => Err(Error::ScaleTimeout {
            workload: name.to_string(),
            replicas,
            seconds,
        }),
        other => {
            other?;
            info!(namespace = %namespace, workload = %name, replicas, "workload settled");
            Ok(())
        }
    }
}
