//! Cluster resource client
//!
//! Thin accessor over the objects the migration touches: claims, volumes,
//! StatefulSets, and Jobs. API errors are translated into the typed
//! `NotFound` / `AlreadyExists` / `Conflict` variants so callers can apply
//! their idempotence rules without inspecting status codes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pvscope_common::Error;

/// Kind names used in errors
pub mod kinds {
    /// PersistentVolumeClaim
    pub const CLAIM: &str = "PersistentVolumeClaim";
    /// PersistentVolume
    pub const VOLUME: &str = "PersistentVolume";
    /// StatefulSet
    pub const STATEFUL_SET: &str = "StatefulSet";
    /// Job
    pub const JOB: &str = "Job";
}

/// Trait abstracting the Kubernetes API for the migration
///
/// Production code uses `KubeClusterClient`; tests substitute a mock or an
/// in-memory cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a claim
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<PersistentVolumeClaim, Error>;

    /// Create a claim; fails with `AlreadyExists` if the name is taken
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Delete a claim; fails with `NotFound` if it is already gone
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a volume
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, Error>;

    /// Replace a volume; fails with `Conflict` if its resourceVersion is stale
    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, Error>;

    /// Get a StatefulSet
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet, Error>;

    /// Replace a StatefulSet; fails with `Conflict` if its resourceVersion is stale
    async fn replace_stateful_set(
        &self,
        namespace: &str,
        set: &StatefulSet,
    ) -> Result<StatefulSet, Error>;

    /// Create a Job; fails with `AlreadyExists` if the name is taken
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error>;

    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, Error>;

    /// Delete a Job and its pods in the background
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Translate an API error into the typed taxonomy
fn map_api_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind, name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name),
        other => other.into(),
    }
}

fn object_name(name: &Option<String>, kind: &str) -> Result<String, Error> {
    name.clone()
        .ok_or_else(|| Error::validation(format!("{} has no name", kind)))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, kinds::CLAIM, name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let name = object_name(&claim.metadata.name, kinds::CLAIM)?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace = %namespace, claim = %name, "creating claim");
        api.create(&PostParams::default(), claim)
            .await
            .map_err(|e| map_api_error(e, kinds::CLAIM, &name))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace = %namespace, claim = %name, "deleting claim");
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(e, kinds::CLAIM, name))
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, kinds::VOLUME, name))
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, Error> {
        let name = object_name(&volume.metadata.name, kinds::VOLUME)?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.replace(&name, &PostParams::default(), volume)
            .await
            .map_err(|e| map_api_error(e, kinds::VOLUME, &name))
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, kinds::STATEFUL_SET, name))
    }

    async fn replace_stateful_set(
        &self,
        namespace: &str,
        set: &StatefulSet,
    ) -> Result<StatefulSet, Error> {
        let name = object_name(&set.metadata.name, kinds::STATEFUL_SET)?;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &PostParams::default(), set)
            .await
            .map_err(|e| map_api_error(e, kinds::STATEFUL_SET, &name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let name = object_name(&job.metadata.name, kinds::JOB)?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace = %namespace, job = %name, "creating job");
        api.create(&PostParams::default(), job)
            .await
            .map_err(|e| map_api_error(e, kinds::JOB, &name))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_api_error(e, kinds::JOB, name))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace = %namespace, job = %name, "deleting job");
        api.delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(e, kinds::JOB, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_map_api_error() {
        assert!(matches!(
            map_api_error(api_error(404, "NotFound"), kinds::CLAIM, "data"),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            map_api_error(api_error(409, "AlreadyExists"), kinds::CLAIM, "data"),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            map_api_error(api_error(409, "Conflict"), kinds::VOLUME, "pv-a"),
            Error::Conflict { .. }
        ));
        assert!(matches!(
            map_api_error(api_error(500, "InternalError"), kinds::VOLUME, "pv-a"),
            Error::Kube { .. }
        ));
    }

    #[test]
    fn test_mapped_errors_carry_object_identity() {
        let err = map_api_error(api_error(404, "NotFound"), kinds::VOLUME, "pv-a");
        assert_eq!(err.to_string(), "PersistentVolume pv-a not found");
    }
}
