//! Data copy Job
//!
//! Copies the contents of one claim into another by running a sync container
//! with both claims mounted. The Job name is derived from the source claim,
//! so a restarted migration reattaches to a Job it already created instead
//! of starting a second copy.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pvscope_common::{poll_until, Error, PollSpec, LABEL_MANAGED_BY, MANAGED_BY};

use crate::client::ClusterClient;

/// Default sync image
pub const DEFAULT_COPY_IMAGE: &str = "rclone/rclone:latest";

/// Default wait for the copy to finish
pub const COPY_POLL: PollSpec = PollSpec::secs(5, 1800);

/// Mount path of the source claim inside the copy container
const SOURCE_MOUNT_PATH: &str = "/data/src";
/// Mount path of the destination claim inside the copy container
const DEST_MOUNT_PATH: &str = "/data/dest";

const JOB_NAME_SUFFIX: &str = "-pvscope-sync";
const MAX_JOB_NAME_LEN: usize = 63;

/// Label carrying the source claim name on copy Jobs and their pods
pub const LABEL_SOURCE_CLAIM: &str = "pvscope.io/source-claim";

fn default_command() -> Vec<String> {
    ["rclone", "sync", "/data/src/", "/data/dest/", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// How copy Jobs are built and awaited
#[derive(Clone, Debug, PartialEq)]
pub struct CopyConfig {
    /// Container image running the sync
    pub image: String,
    /// Container command; sees the source at `/data/src` and the destination at `/data/dest`
    pub command: Vec<String>,
    /// Pull secrets for the image
    pub image_pull_secrets: Vec<String>,
    /// Poll interval and overall copy budget
    pub poll: PollSpec,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_COPY_IMAGE.to_string(),
            command: default_command(),
            image_pull_secrets: Vec::new(),
            poll: COPY_POLL,
        }
    }
}

/// Derive the copy Job name for a source claim.
///
/// Truncated to the Job name limit; a trailing `-` left by truncation is
/// dropped so the name stays a valid DNS label.
pub fn job_name(source_claim: &str) -> String {
    let mut name = format!("{}{}", source_claim, JOB_NAME_SUFFIX);
    if name.len() > MAX_JOB_NAME_LEN {
        name.truncate(MAX_JOB_NAME_LEN);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}

/// Everything needed to build one copy Job
#[derive(Clone, Debug, PartialEq)]
pub struct CopyJobSpec {
    /// Claim read from
    pub source_claim: String,
    /// Claim written to
    pub dest_claim: String,
    /// Namespace of both claims
    pub namespace: String,
    /// Container image
    pub image: String,
    /// Container command
    pub command: Vec<String>,
    /// Image pull secret names
    pub image_pull_secrets: Vec<String>,
}

impl CopyJobSpec {
    /// Build a spec from the claim pair and the configured image
    pub fn new(source_claim: &str, dest_claim: &str, namespace: &str, config: &CopyConfig) -> Self {
        Self {
            source_claim: source_claim.to_string(),
            dest_claim: dest_claim.to_string(),
            namespace: namespace.to_string(),
            image: config.image.clone(),
            command: config.command.clone(),
            image_pull_secrets: config.image_pull_secrets.clone(),
        }
    }

    /// Name of the Job this spec builds
    pub fn job_name(&self) -> String {
        job_name(&self.source_claim)
    }

    /// Build the Job.
    ///
    /// The Job never retries a failed pod (`backoffLimit: 0`,
    /// `restartPolicy: Never`): a failed copy is reported, not repeated.
    pub fn to_job(&self) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(LABEL_SOURCE_CLAIM.to_string(), self.source_claim.clone());

        let container = Container {
            name: "sync".to_string(),
            image: Some(self.image.clone()),
            command: Some(self.command.clone()),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "source".to_string(),
                    mount_path: SOURCE_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "dest".to_string(),
                    mount_path: DEST_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let claim_volume = |name: &str, claim: &str| Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        };

        let pull_secrets = (!self.image_pull_secrets.is_empty()).then(|| {
            self.image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        });

        Job {
            metadata: ObjectMeta {
                name: Some(self.job_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![
                            claim_volume("source", &self.source_claim),
                            claim_volume("dest", &self.dest_claim),
                        ]),
                        image_pull_secrets: pull_secrets,
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Succeeded and failed pod counts of a Job
fn job_counts(job: &Job) -> (i32, i32) {
    job.status
        .as_ref()
        .map(|s| (s.succeeded.unwrap_or(0), s.failed.unwrap_or(0)))
        .unwrap_or((0, 0))
}

async fn await_job(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let what = format!("copy job {}/{}", namespace, name);
    let waited = poll_until(spec, &what, cancel, || async move {
        let (succeeded, failed) = job_counts(&client.get_job(namespace, name).await?);
        if succeeded > 0 {
            return Ok(true);
        }
        if failed > 0 {
            return Err(Error::CopyFailed {
                job: name.to_string(),
                failed,
            });
        }
        Ok(false)
    })
    .await;

    // A failed copy is the verdict itself, not a failure to observe it
    match waited {
        Err(Error::Predicate { source, .. }) if matches!(*source, Error::CopyFailed { .. }) => {
            Err(*source)
        }
        other => other,
    }
}

/// Copy the contents of `source` into `dest` and wait for the copy to finish.
///
/// The Job is deleted afterwards whatever the outcome, so its pods release
/// both claims. A failure to delete is only reported when the copy itself
/// succeeded; otherwise the copy error wins.
pub async fn run_copy(
    client: &dyn ClusterClient,
    source: &str,
    dest: &str,
    namespace: &str,
    config: &CopyConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let spec = CopyJobSpec::new(source, dest, namespace, config);
    let name = spec.job_name();

    match client.create_job(namespace, &spec.to_job()).await {
        Ok(_) => info!(namespace = %namespace, job = %name, source = %source, dest = %dest, "copy job created"),
        Err(e) if e.is_already_exists() => {
            info!(namespace = %namespace, job = %name, "copy job already exists, reattaching")
        }
        Err(e) => return Err(e),
    }

    let outcome = await_job(client, namespace, &name, config.poll, cancel).await;

    let cleanup = match client.delete_job(namespace, &name).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    };

    match (outcome, cleanup) {
        (Ok(()), cleanup) => {
            cleanup?;
            info!(namespace = %namespace, job = %name, "copy completed");
            Ok(())
        }
        (Err(e), Err(cleanup_err)) => {
            warn!(namespace = %namespace, job = %name, error = %cleanup_err, "failed to delete copy job");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
