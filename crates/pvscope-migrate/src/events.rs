//! Kubernetes Events for migration progress
//!
//! Events are recorded against the claim being migrated, so `kubectl
//! describe pvc` shows how far a migration got. Publishing is
//! fire-and-forget: a failed event is logged and never aborts a migration.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting component written on every Event
pub const REPORTER: &str = "pvscope";

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason, one of [`reasons`]
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as [`REPORTER`]
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: ACTION_MIGRATE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _note: Option<String>,
    ) {
    }
}

/// Action recorded on every migration Event
pub const ACTION_MIGRATE: &str = "Migrate";

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// Migration accepted and first step about to run
    pub const MIGRATION_STARTED: &str = "MigrationStarted";
    /// One saga step finished
    pub const STEP_COMPLETED: &str = "StepCompleted";
    /// Claim now bound to the resized volume
    pub const MIGRATION_COMPLETED: &str = "MigrationCompleted";
    /// A step failed for good; the checkpoint is kept
    pub const MIGRATION_ABORTED: &str = "MigrationAborted";
}

/// Reference to a claim for use as an Event subject
pub fn claim_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}
