//! Step registry: which function runs for each saga step

use std::collections::BTreeMap;

use futures::future::BoxFuture;

use pvscope_common::Error;

use super::state::{MigrationState, SagaStep};
use super::{steps, Migrator};

/// A saga step: takes the state so far and returns it updated
pub type StepFn =
    for<'a> fn(&'a Migrator, MigrationState) -> BoxFuture<'a, Result<MigrationState, Error>>;

/// Maps each step to its implementation
#[derive(Clone)]
pub struct StepRegistry {
    steps: BTreeMap<SagaStep, StepFn>,
}

impl StepRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    /// Register (or replace) the function for a step
    pub fn register(&mut self, step: SagaStep, f: StepFn) -> &mut Self {
        self.steps.insert(step, f);
        self
    }

    /// Function registered for a step
    pub fn get(&self, step: SagaStep) -> Option<StepFn> {
        self.steps.get(&step).copied()
    }

    /// Registry wired with the resize-and-rebind steps
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(SagaStep::Fetch, steps::fetch)
            .register(SagaStep::Protect, steps::protect)
            .register(SagaStep::Stage, steps::stage)
            .register(SagaStep::ProtectStaging, steps::protect_staging)
            .register(SagaStep::Quiesce, steps::quiesce)
            .register(SagaStep::Copy, steps::copy)
            .register(SagaStep::Reclaim, steps::reclaim)
            .register(SagaStep::Rebind, steps::rebind)
            .register(SagaStep::RestorePolicy, steps::restore_policy)
            .register(SagaStep::Resume, steps::resume);
        registry
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
