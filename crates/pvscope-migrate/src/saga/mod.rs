//! Resize-and-rebind migration saga
//!
//! `Migrator::run` executes the registered steps strictly in order. Before
//! each step the state is checkpointed; each step runs under the configured
//! retry policy and a step that exhausts it aborts the saga. There is no
//! automatic rollback: the original volume is Retain-protected from the
//! second step on, so an aborted migration can always be finished or
//! reversed by hand from the reported state.

mod checkpoint;
mod registry;
mod state;
mod steps;

use std::sync::Arc;

use kube::runtime::events::EventType;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pvscope_common::{retry_with_backoff, Error};

use crate::client::ClusterClient;
use crate::config::MigrateConfig;
use crate::events::{claim_reference, reasons, EventPublisher, NoopEventPublisher};

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use registry::{StepFn, StepRegistry};
pub use state::{MigrationRequest, MigrationState, SagaStep};

/// Terminal failure of a migration
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request was refused before any step ran
    #[error("migration rejected: {source}")]
    Rejected {
        /// Why the request was refused
        source: Error,
    },

    /// A step failed for good; the cluster is left as the last completed step left it
    #[error("migration aborted at step {step}: {source}")]
    Aborted {
        /// Step that failed
        step: SagaStep,
        /// State captured up to the failure
        state: Box<MigrationState>,
        /// Error from the last attempt
        source: Error,
    },
}

impl SagaError {
    /// Step the saga stopped at, if any step ran
    pub fn step(&self) -> Option<SagaStep> {
        match self {
            SagaError::Rejected { .. } => None,
            SagaError::Aborted { step, .. } => Some(*step),
        }
    }

    /// State captured at the failure, if any step ran
    pub fn state(&self) -> Option<&MigrationState> {
        match self {
            SagaError::Rejected { .. } => None,
            SagaError::Aborted { state, .. } => Some(state.as_ref()),
        }
    }
}

/// Runs migrations against one cluster
pub struct Migrator {
    client: Arc<dyn ClusterClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventPublisher>,
    config: MigrateConfig,
    registry: StepRegistry,
    cancel: CancellationToken,
}

/// Builder for [`Migrator`]
pub struct MigratorBuilder {
    client: Arc<dyn ClusterClient>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: MigrateConfig,
    registry: StepRegistry,
    cancel: CancellationToken,
}

impl MigratorBuilder {
    /// Where to persist progress; defaults to an in-memory store
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Where to publish Events; defaults to dropping them
    pub fn events(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(publisher);
        self
    }

    /// Wait budgets and retry policy
    pub fn config(mut self, config: MigrateConfig) -> Self {
        self.config = config;
        self
    }

    /// Step implementations; defaults to [`StepRegistry::standard`]
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Token that cancels every wait and retry backoff
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the migrator
    pub fn build(self) -> Migrator {
        Migrator {
            client: self.client,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            config: self.config,
            registry: self.registry,
            cancel: self.cancel,
        }
    }
}

impl Migrator {
    /// Start building a migrator around a cluster client
    pub fn builder(client: Arc<dyn ClusterClient>) -> MigratorBuilder {
        MigratorBuilder {
            client,
            checkpoints: None,
            events: None,
            config: MigrateConfig::default(),
            registry: StepRegistry::standard(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cluster client used by the steps
    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    /// Active configuration
    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// Cancellation token threaded through every wait
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Persist `state` with `next_step` as the step to resume at
    pub(crate) async fn checkpoint(
        &self,
        state: &MigrationState,
        next_step: SagaStep,
    ) -> Result<(), Error> {
        self.checkpoints
            .save(&Checkpoint::new(state.clone(), next_step))
            .await
    }

    /// Most recent checkpointed state for the same request
    ///
    /// A step may checkpoint part of its own progress; retries start from that.
    async fn latest_state(&self, fallback: &MigrationState) -> Result<MigrationState, Error> {
        let request = &fallback.request;
        match self
            .checkpoints
            .load(&request.namespace, &request.claim_name)
            .await?
        {
            Some(cp) if cp.state.request == *request => Ok(cp.state),
            _ => Ok(fallback.clone()),
        }
    }

    /// Run a migration to completion
    ///
    /// Resumes from a checkpoint left by an earlier run of the same request.
    /// A checkpoint for a different request on the same claim rejects the new
    /// one until it is cleared.
    pub async fn run(&self, request: MigrationRequest) -> Result<MigrationState, SagaError> {
        request
            .validate()
            .and_then(|()| self.config.validate())
            .map_err(|source| SagaError::Rejected { source })?;

        let namespace = request.namespace.clone();
        let claim = request.claim_name.clone();

        let existing = self
            .checkpoints
            .load(&namespace, &claim)
            .await
            .map_err(|source| SagaError::Rejected { source })?;

        let (mut state, mut step) = match existing {
            Some(cp) if cp.state.request == request => {
                info!(
                    namespace = %namespace,
                    claim = %claim,
                    step = %cp.next_step,
                    "resuming migration from checkpoint"
                );
                (cp.state, cp.next_step)
            }
            Some(cp) => {
                return Err(SagaError::Rejected {
                    source: Error::validation(format!(
                        "a different migration of {}/{} to {} stopped at step {}; forget it before starting another",
                        namespace, claim, cp.state.request.target_size, cp.next_step
                    )),
                })
            }
            None => (MigrationState::new(request), SagaStep::Fetch),
        };

        let subject = claim_reference(&namespace, &claim);
        info!(
            namespace = %namespace,
            claim = %claim,
            target_size = %state.request.target_size,
            step = %step,
            "starting migration"
        );
        self.events
            .publish(
                &subject,
                EventType::Normal,
                reasons::MIGRATION_STARTED,
                Some(format!(
                    "Resizing to {} from step {}",
                    state.request.target_size, step
                )),
            )
            .await;

        loop {
            let Some(handler) = self.registry.get(step) else {
                let source = Error::internal_with_context(
                    "migrator",
                    format!("no function registered for step {}", step),
                );
                return Err(self.abort(step, state, source).await);
            };

            if let Err(source) = self.checkpoint(&state, step).await {
                return Err(self.abort(step, state, source).await);
            }

            info!(namespace = %namespace, claim = %claim, step = %step, "running step");
            let current = &state;
            let result = retry_with_backoff(&self.config.retry, step.name(), &self.cancel, || async move {
                let attempt = self.latest_state(current).await?;
                handler(self, attempt).await
            })
            .await;

            match result {
                Ok(next) => state = next,
                Err(source) => return Err(self.abort(step, state, source).await),
            }

            info!(namespace = %namespace, claim = %claim, step = %step, "step completed");
            self.events
                .publish(
                    &subject,
                    EventType::Normal,
                    reasons::STEP_COMPLETED,
                    Some(format!("Step {} completed", step)),
                )
                .await;

            match step.next() {
                Some(next) => step = next,
                None => break,
            }
        }

        if let Err(e) = self.checkpoints.clear(&namespace, &claim).await {
            warn!(namespace = %namespace, claim = %claim, error = %e, "failed to clear checkpoint");
        }

        info!(namespace = %namespace, claim = %claim, "migration completed");
        self.events
            .publish(
                &subject,
                EventType::Normal,
                reasons::MIGRATION_COMPLETED,
                Some(format!(
                    "Claim now bound to a {} volume",
                    state.request.target_size
                )),
            )
            .await;

        Ok(state)
    }

    /// Record an aborted step and build the terminal error
    async fn abort(&self, step: SagaStep, state: MigrationState, source: Error) -> SagaError {
        let latest = self.latest_state(&state).await;
        let state = latest.unwrap_or(state);
        let request = &state.request;
        error!(
            namespace = %request.namespace,
            claim = %request.claim_name,
            step = %step,
            error = %source,
            "migration aborted"
        );

        let mut checkpoint = Checkpoint::new(state.clone(), step);
        checkpoint.last_error = Some(source.to_string());
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(step = %step, error = %e, "failed to save checkpoint for aborted migration");
        }

        self.events
            .publish(
                &claim_reference(&request.namespace, &request.claim_name),
                EventType::Warning,
                reasons::MIGRATION_ABORTED,
                Some(format!("Step {} failed: {}", step, source)),
            )
            .await;

        SagaError::Aborted {
            step,
            state: Box::new(state),
            source,
        }
    }
}
