//! In-memory cluster for saga tests
//!
//! Models just enough controller behavior to drive a migration: claims bind
//! a few polls after creation (to a pinned volume if it is free, otherwise
//! to a freshly provisioned one), deleting a claim deletes or releases its
//! volume according to the reclaim policy, StatefulSets settle instantly,
//! and copy Jobs finish with a scripted outcome a few polls after creation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use parking_lot::Mutex;

use pvscope_common::{Error, PollSpec, RetryConfig};

use crate::claim::{PHASE_BOUND, RESOURCE_STORAGE};
use crate::client::{kinds, ClusterClient};
use crate::config::MigrateConfig;
use crate::copy::CopyConfig;
use crate::events::EventPublisher;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// How copy Jobs finish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Succeed,
    Fail,
    /// Never finishes
    Hang,
}

#[derive(Default)]
struct ClusterState {
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    polls_until_bound: BTreeMap<Key, u32>,
    volumes: BTreeMap<String, PersistentVolume>,
    sets: BTreeMap<Key, StatefulSet>,
    jobs: BTreeMap<Key, Job>,
    polls_until_done: BTreeMap<Key, u32>,
    provisioned: u8,
    calls: Vec<String>,
    failures: BTreeMap<&'static str, u32>,
}

impl ClusterState {
    fn inject(&mut self, op: &'static str) -> Result<(), Error> {
        match self.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(Error::internal_with_context(op, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn provision(&mut self, claim: &PersistentVolumeClaim) -> String {
        let name = format!("pv-{}", (b'b' + self.provisioned) as char);
        self.provisioned += 1;

        let spec = claim.spec.clone().unwrap_or_default();
        let capacity = spec
            .resources
            .and_then(|r| r.requests)
            .unwrap_or_default();
        self.volumes.insert(
            name.clone(),
            volume_object(&name, capacity, "Delete", spec.storage_class_name),
        );
        name
    }

    /// Bind a pending claim; false if its pinned volume is not free yet
    fn try_bind(&mut self, k: &Key) -> bool {
        let Some(claim) = self.claims.get(k).cloned() else {
            return false;
        };
        let pinned = claim.spec.as_ref().and_then(|s| s.volume_name.clone());

        let volume_name = match pinned {
            Some(name) => {
                let Some(pv) = self.volumes.get(&name) else {
                    return false;
                };
                let claimed_elsewhere = pv
                    .spec
                    .as_ref()
                    .and_then(|s| s.claim_ref.as_ref())
                    .map(|r| {
                        r.namespace.as_deref() != Some(k.0.as_str())
                            || r.name.as_deref() != Some(k.1.as_str())
                    })
                    .unwrap_or(false);
                if claimed_elsewhere {
                    return false;
                }
                name
            }
            None => self.provision(&claim),
        };

        if let Some(pv) = self.volumes.get_mut(&volume_name) {
            pv.spec.get_or_insert_with(Default::default).claim_ref = Some(ObjectReference {
                namespace: Some(k.0.clone()),
                name: Some(k.1.clone()),
                ..Default::default()
            });
            pv.status = Some(PersistentVolumeStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            });
        }
        if let Some(claim) = self.claims.get_mut(k) {
            claim.spec.get_or_insert_with(Default::default).volume_name = Some(volume_name);
            claim.status = Some(PersistentVolumeClaimStatus {
                phase: Some(PHASE_BOUND.to_string()),
                ..Default::default()
            });
        }
        true
    }
}

fn volume_object(
    name: &str,
    capacity: BTreeMap<String, Quantity>,
    policy: &str,
    storage_class: Option<String>,
) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity),
            persistent_volume_reclaim_policy: Some(policy.to_string()),
            storage_class_name: storage_class,
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some("Available".to_string()),
            ..Default::default()
        }),
    }
}

/// Fake cluster implementing [`ClusterClient`]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
    bind_after: u32,
    job_after: u32,
    job_outcome: Mutex<JobOutcome>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            bind_after: 2,
            job_after: 3,
            job_outcome: Mutex::new(JobOutcome::Succeed),
        }
    }

    pub(crate) fn set_job_outcome(&self, outcome: JobOutcome) {
        *self.job_outcome.lock() = outcome;
    }

    /// Fail the next `times` calls of `op` with a retryable error
    pub(crate) fn fail_next(&self, op: &'static str, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// Add a claim already bound to a volume with the given policy
    pub(crate) fn seed_bound_claim(
        &self,
        namespace: &str,
        name: &str,
        size: &str,
        volume: &str,
        policy: &str,
    ) {
        let storage = BTreeMap::from([(RESOURCE_STORAGE.to_string(), Quantity(size.to_string()))]);
        let mut state = self.state.lock();

        let mut pv = volume_object(volume, storage.clone(), policy, Some("standard".to_string()));
        if let Some(spec) = pv.spec.as_mut() {
            spec.claim_ref = Some(ObjectReference {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            });
        }
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        state.volumes.insert(volume.to_string(), pv);

        state.claims.insert(
            key(namespace, name),
            PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                    annotations: Some(BTreeMap::from([(
                        "pv.kubernetes.io/bind-completed".to_string(),
                        "yes".to_string(),
                    )])),
                    uid: Some(format!("uid-{}", name)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some("standard".to_string()),
                    volume_name: Some(volume.to_string()),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(storage),
                        limits: None,
                    }),
                    ..Default::default()
                }),
                status: Some(PersistentVolumeClaimStatus {
                    phase: Some(PHASE_BOUND.to_string()),
                    ..Default::default()
                }),
            },
        );
    }

    /// Add a StatefulSet that is settled at `replicas`
    pub(crate) fn seed_stateful_set(&self, namespace: &str, name: &str, replicas: i32) {
        self.state.lock().sets.insert(
            key(namespace, name),
            StatefulSet {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(StatefulSetSpec {
                    replicas: Some(replicas),
                    ..Default::default()
                }),
                status: Some(StatefulSetStatus {
                    replicas,
                    ready_replicas: Some(replicas),
                    ..Default::default()
                }),
            },
        );
    }

    pub(crate) fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.lock().claims.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub(crate) fn replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.state
            .lock()
            .sets
            .get(&key(namespace, name))
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.replicas)
    }

    pub(crate) fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Mutating calls so far, e.g. `create_claim db/data-staging`
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, Error> {
        let mut state = self.state.lock();
        state.inject("get_claim")?;
        let k = key(namespace, name);

        if let Some(remaining) = state.polls_until_bound.get(&k).copied() {
            if remaining > 1 {
                state.polls_until_bound.insert(k.clone(), remaining - 1);
            } else if state.try_bind(&k) {
                state.polls_until_bound.remove(&k);
            }
        }

        state
            .claims
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found(kinds::CLAIM, name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let mut state = self.state.lock();
        state.inject("create_claim")?;
        let name = claim.metadata.name.clone().unwrap_or_default();
        let k = key(namespace, &name);
        if state.claims.contains_key(&k) {
            return Err(Error::already_exists(kinds::CLAIM, name));
        }

        let mut created = claim.clone();
        created.metadata.uid = Some(format!("uid-{}-{}", name, state.calls.len()));
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.claims.insert(k.clone(), created.clone());
        state.polls_until_bound.insert(k, self.bind_after);
        state.record(format!("create_claim {}/{}", namespace, name));
        Ok(created)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.inject("delete_claim")?;
        let k = key(namespace, name);
        let claim = state
            .claims
            .remove(&k)
            .ok_or_else(|| Error::not_found(kinds::CLAIM, name))?;
        state.polls_until_bound.remove(&k);
        state.record(format!("delete_claim {}/{}", namespace, name));

        let bound = claim.spec.and_then(|s| s.volume_name);
        if let Some(volume_name) = bound {
            let policy = state
                .volumes
                .get(&volume_name)
                .and_then(|pv| pv.spec.as_ref())
                .and_then(|s| s.persistent_volume_reclaim_policy.clone());
            if policy.as_deref() == Some("Retain") {
                if let Some(pv) = state.volumes.get_mut(&volume_name) {
                    pv.status = Some(PersistentVolumeStatus {
                        phase: Some("Released".to_string()),
                        ..Default::default()
                    });
                }
            } else {
                state.volumes.remove(&volume_name);
            }
        }
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, Error> {
        let mut state = self.state.lock();
        state.inject("get_volume")?;
        state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(kinds::VOLUME, name))
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, Error> {
        let mut state = self.state.lock();
        state.inject("replace_volume")?;
        let name = volume.metadata.name.clone().unwrap_or_default();
        if !state.volumes.contains_key(&name) {
            return Err(Error::not_found(kinds::VOLUME, name));
        }
        state.volumes.insert(name.clone(), volume.clone());
        state.record(format!("replace_volume {}", name));
        Ok(volume.clone())
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet, Error> {
        let mut state = self.state.lock();
        state.inject("get_stateful_set")?;
        state
            .sets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found(kinds::STATEFUL_SET, name))
    }

    async fn replace_stateful_set(
        &self,
        namespace: &str,
        set: &StatefulSet,
    ) -> Result<StatefulSet, Error> {
        let mut state = self.state.lock();
        state.inject("replace_stateful_set")?;
        let name = set.metadata.name.clone().unwrap_or_default();
        let k = key(namespace, &name);
        if !state.sets.contains_key(&k) {
            return Err(Error::not_found(kinds::STATEFUL_SET, name));
        }

        let replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let mut stored = set.clone();
        stored.status = Some(StatefulSetStatus {
            replicas,
            ready_replicas: Some(replicas),
            ..Default::default()
        });
        state.sets.insert(k, stored.clone());
        state.record(format!("scale {}/{} {}", namespace, name, replicas));
        Ok(stored)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let mut state = self.state.lock();
        state.inject("create_job")?;
        let name = job.metadata.name.clone().unwrap_or_default();
        let k = key(namespace, &name);
        if state.jobs.contains_key(&k) {
            return Err(Error::already_exists(kinds::JOB, name));
        }
        state.jobs.insert(k.clone(), job.clone());
        state.polls_until_done.insert(k, self.job_after);
        state.record(format!("create_job {}/{}", namespace, name));
        Ok(job.clone())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, Error> {
        let outcome = *self.job_outcome.lock();
        let mut state = self.state.lock();
        state.inject("get_job")?;
        let k = key(namespace, name);

        if let Some(remaining) = state.polls_until_done.get(&k).copied() {
            if remaining > 1 || outcome == JobOutcome::Hang {
                state.polls_until_done.insert(k.clone(), remaining.saturating_sub(1).max(1));
            } else {
                state.polls_until_done.remove(&k);
                if let Some(job) = state.jobs.get_mut(&k) {
                    job.status = Some(match outcome {
                        JobOutcome::Fail => JobStatus {
                            failed: Some(1),
                            ..Default::default()
                        },
                        _ => JobStatus {
                            succeeded: Some(1),
                            ..Default::default()
                        },
                    });
                }
            }
        }

        state
            .jobs
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found(kinds::JOB, name))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.inject("delete_job")?;
        let k = key(namespace, name);
        state.polls_until_done.remove(&k);
        state
            .jobs
            .remove(&k)
            .ok_or_else(|| Error::not_found(kinds::JOB, name))?;
        state.record(format!("delete_job {}/{}", namespace, name));
        Ok(())
    }
}

/// Publisher that keeps every Event for inspection
#[derive(Default)]
pub(crate) struct RecordingEventPublisher {
    events: Mutex<Vec<(bool, String)>>,
}

impl RecordingEventPublisher {
    /// Reasons in publish order
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Reasons of Warning events
    pub(crate) fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(warning, _)| *warning)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _note: Option<String>,
    ) {
        let warning = matches!(type_, EventType::Warning);
        self.events.lock().push((warning, reason.to_string()));
    }
}

/// Millisecond polls and retries so saga tests finish quickly
pub(crate) fn fast_config() -> MigrateConfig {
    let poll = PollSpec::new(Duration::from_millis(1), Duration::from_secs(2));
    MigrateConfig {
        policy_poll: poll,
        unlink_poll: poll,
        bind_poll: poll,
        delete_poll: poll,
        scale_poll: poll,
        copy: CopyConfig {
            poll,
            ..Default::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}
