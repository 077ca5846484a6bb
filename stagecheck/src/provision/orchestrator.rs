//! The Multi-Stage Provisioning Orchestrator.

use super::teardown::panic_message;
use super::{AcquiredStack, InputVars, Provisioner, StageSpec, TeardownReport};
use crate::config::{RunConfig, CONFIG_NAMESPACE};
use crate::core::{check_order, Resolver, StageOutput, StageOutputs};
use crate::errors::{
    PlanValidationError, ProvisioningError, StageApplyError, UnresolvedReferenceError,
};
use crate::events::{event_types, EventSink, NoOpEventSink};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Why acquiring the stages stopped.
enum AcquireFailure {
    Invalid(PlanValidationError),
    Unresolved(UnresolvedReferenceError),
    Apply(StageApplyError),
}

impl AcquireFailure {
    fn into_error(self, teardown: TeardownReport) -> ProvisioningError {
        match self {
            Self::Invalid(err) => ProvisioningError::InvalidPlan(err),
            Self::Unresolved(source) => ProvisioningError::UnresolvedReference { source, teardown },
            Self::Apply(source) => ProvisioningError::StageApply { source, teardown },
        }
    }
}

/// The result of a scoped run whose stages all applied.
#[derive(Debug)]
pub struct RunOutcome<T> {
    /// Identifier of the run.
    pub run_id: Uuid,
    /// What the body returned.
    pub value: T,
    /// Outputs of every stage, in run order.
    pub outputs: StageOutputs,
    /// Teardown that followed the body.
    pub teardown: TeardownReport,
}

impl<T> RunOutcome<T> {
    /// Returns the body's value, or a `Teardown` error if releasing resources failed.
    pub fn into_result(self) -> Result<T, ProvisioningError> {
        if self.teardown.is_clean() {
            Ok(self.value)
        } else {
            Err(ProvisioningError::Teardown(self.teardown))
        }
    }
}

/// Live infrastructure produced by [`Orchestrator::provision`].
///
/// Call [`Deployment::teardown`] to release it; dropping a deployment that
/// still holds stages only logs a warning.
pub struct Deployment {
    run_id: Uuid,
    outputs: StageOutputs,
    stack: AcquiredStack,
    provisioner: Arc<dyn Provisioner>,
    sink: Arc<dyn EventSink>,
    keep_after: bool,
}

impl Deployment {
    /// Returns the run identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the captured stage outputs.
    #[must_use]
    pub fn outputs(&self) -> &StageOutputs {
        &self.outputs
    }

    /// Returns the acquired stage identifiers in acquisition order.
    #[must_use]
    pub fn stages(&self) -> Vec<&str> {
        self.stack.ids()
    }

    /// Releases every stage in reverse order of acquisition.
    pub async fn teardown(mut self) -> TeardownReport {
        let span = tracing::info_span!("teardown", run_id = %self.run_id);
        self.stack
            .release_all(self.provisioner.as_ref(), self.keep_after, self.sink.as_ref())
            .instrument(span)
            .await
    }

    /// Releases every stage and returns the outputs, failing if any release failed.
    pub async fn into_outputs(mut self) -> Result<Vec<StageOutput>, ProvisioningError> {
        let outputs = std::mem::take(&mut self.outputs);
        let report = self.teardown().await;
        if report.is_clean() {
            Ok(outputs.into_vec())
        } else {
            Err(ProvisioningError::Teardown(report))
        }
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("run_id", &self.run_id)
            .field("stages", &self.stack.ids())
            .field("keep_after", &self.keep_after)
            .finish_non_exhaustive()
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            warn!(
                run_id = %self.run_id,
                stages = ?self.stack.ids(),
                "Deployment dropped without teardown; resources are still provisioned"
            );
        }
    }
}

/// Runs an ordered sequence of stages, threading outputs forward.
///
/// Stages run strictly one after another. Whatever was acquired is released
/// in reverse order when the run ends, fails, panics or times out, unless the
/// run configuration or the stage asks to keep it.
#[derive(Clone)]
pub struct Orchestrator {
    provisioner: Arc<dyn Provisioner>,
    config: Arc<RunConfig>,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(provisioner: Arc<dyn Provisioner>, config: RunConfig) -> Self {
        Self {
            provisioner,
            config: Arc::new(config),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink that receives stage lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Validates a stage plan without applying anything.
    ///
    /// Checks that the plan is non-empty, that identifiers are unique and not
    /// reserved, and that every reference points at an earlier stage or at a
    /// configured value.
    pub fn validate(&self, stages: &[StageSpec]) -> Result<(), ProvisioningError> {
        if stages.is_empty() {
            return Err(PlanValidationError::new("Stage plan has no stages").into());
        }

        let mut seen = HashSet::new();
        for stage in stages {
            if stage.id.trim().is_empty() {
                return Err(PlanValidationError::new("Stage identifier must not be empty").into());
            }
            if stage.id == CONFIG_NAMESPACE {
                return Err(PlanValidationError::new(format!(
                    "Stage identifier '{CONFIG_NAMESPACE}' is reserved"
                ))
                .with_stages(vec![stage.id.clone()])
                .into());
            }
            if stage.id.contains('.') {
                return Err(PlanValidationError::new(format!(
                    "Stage identifier '{}' must not contain '.'",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()])
                .into());
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(PlanValidationError::new(format!("Duplicate stage '{}'", stage.id))
                    .with_stages(vec![stage.id.clone()])
                    .into());
            }
        }

        let ids: Vec<&str> = stages.iter().map(|s| s.id.as_str()).collect();
        for (index, stage) in stages.iter().enumerate() {
            check_order(
                &stage.id,
                &stage.inputs_value(),
                &ids[..index],
                &ids[index..],
                &self.config,
            )
            .map_err(|source| ProvisioningError::UnresolvedReference {
                source,
                teardown: TeardownReport::default(),
            })?;
        }
        Ok(())
    }

    fn resolve_inputs(
        &self,
        stage: &StageSpec,
        outputs: &StageOutputs,
    ) -> Result<InputVars, UnresolvedReferenceError> {
        let resolver = Resolver::new(outputs, &self.config, &stage.id);
        stage
            .inputs
            .iter()
            .map(|(name, value)| resolver.resolve(value).map(|v| (name.clone(), v)))
            .collect()
    }

    async fn acquire(
        &self,
        stages: &[StageSpec],
        stack: &mut AcquiredStack,
        outputs: &mut StageOutputs,
    ) -> Result<(), AcquireFailure> {
        for (index, stage) in stages.iter().enumerate() {
            let inputs = self
                .resolve_inputs(stage, outputs)
                .map_err(AcquireFailure::Unresolved)?;

            info!(stage = %stage.id, index, workdir = %stage.workdir.display(), "Applying stage");
            self.sink
                .emit(
                    event_types::STAGE_APPLY_STARTED,
                    Some(json!({ "stage": stage.id, "index": index })),
                )
                .await;

            stack.begin(stage);
            let outcome = self.provisioner.apply(&stage.workdir, &inputs).await;

            if !outcome.success {
                stack.abandon();
                error!(stage = %stage.id, "Stage failed to apply:\n{}", outcome.raw_log);
                self.sink
                    .emit(event_types::STAGE_APPLY_FAILED, Some(json!({ "stage": stage.id })))
                    .await;
                return Err(AcquireFailure::Apply(StageApplyError::new(
                    &stage.id,
                    outcome.raw_log,
                )));
            }

            stack.complete();
            let output = StageOutput::new(&stage.id, outcome.outputs);
            info!(stage = %stage.id, outputs = %output.redacted(), "Stage applied");
            self.sink
                .emit(
                    event_types::STAGE_APPLY_COMPLETED,
                    Some(json!({ "stage": stage.id, "outputs": output.redacted() })),
                )
                .await;
            outputs
                .record(output)
                .map_err(|e| AcquireFailure::Invalid(PlanValidationError::new(e.to_string())))?;
        }
        Ok(())
    }

    async fn release(&self, stack: &mut AcquiredStack) -> TeardownReport {
        stack
            .release_all(self.provisioner.as_ref(), self.config.keep_after, self.sink.as_ref())
            .await
    }

    /// Applies every stage and returns the live deployment.
    ///
    /// On failure, the stages acquired so far are released newest first and
    /// the error carries the teardown report.
    pub async fn provision(&self, stages: &[StageSpec]) -> Result<Deployment, ProvisioningError> {
        self.validate(stages)?;
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("provision", run_id = %run_id);

        let mut stack = AcquiredStack::new();
        let mut outputs = StageOutputs::new();

        let acquired = {
            let work = AssertUnwindSafe(self.acquire(stages, &mut stack, &mut outputs))
                .catch_unwind()
                .instrument(span.clone());
            match self.config.run_timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.ok(),
                None => Some(work.await),
            }
        };

        match acquired {
            Some(Ok(Ok(()))) => Ok(Deployment {
                run_id,
                outputs,
                stack,
                provisioner: Arc::clone(&self.provisioner),
                sink: Arc::clone(&self.sink),
                keep_after: self.config.keep_after,
            }),
            Some(Ok(Err(failure))) => {
                let teardown = self.release(&mut stack).instrument(span).await;
                Err(failure.into_error(teardown))
            }
            Some(Err(panic)) => {
                self.release(&mut stack).instrument(span).await;
                std::panic::resume_unwind(panic)
            }
            None => {
                warn!(run_id = %run_id, "Run timed out; tearing down");
                let teardown = self.release(&mut stack).instrument(span).await;
                Err(ProvisioningError::TimedOut {
                    timeout: self.config.run_timeout.unwrap_or_default(),
                    teardown,
                })
            }
        }
    }

    /// Applies every stage, then releases everything and returns the outputs.
    pub async fn run(&self, stages: &[StageSpec]) -> Result<Vec<StageOutput>, ProvisioningError> {
        self.provision(stages).await?.into_outputs().await
    }

    /// Applies every stage, hands the outputs to `body`, then releases everything.
    ///
    /// Teardown happens whether `body` returns, panics, or the run timeout
    /// expires. A panic in `body` is resumed after teardown.
    pub async fn run_scoped<F, Fut, T>(
        &self,
        stages: &[StageSpec],
        body: F,
    ) -> Result<RunOutcome<T>, ProvisioningError>
    where
        F: FnOnce(StageOutputs) -> Fut,
        Fut: Future<Output = T>,
    {
        self.validate(stages)?;
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("run", run_id = %run_id);

        let mut stack = AcquiredStack::new();
        let mut outputs = StageOutputs::new();

        let finished = {
            let work = async {
                self.acquire(stages, &mut stack, &mut outputs).await?;
                Ok::<T, AcquireFailure>(body(outputs.clone()).await)
            };
            let work = AssertUnwindSafe(work).catch_unwind().instrument(span.clone());
            match self.config.run_timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.ok(),
                None => Some(work.await),
            }
        };

        let teardown = self.release(&mut stack).instrument(span).await;

        match finished {
            Some(Ok(Ok(value))) => Ok(RunOutcome {
                run_id,
                value,
                outputs,
                teardown,
            }),
            Some(Ok(Err(failure))) => Err(failure.into_error(teardown)),
            Some(Err(panic)) => {
                error!(
                    run_id = %run_id,
                    "Run panicked after teardown: {}",
                    panic_message(panic.as_ref())
                );
                std::panic::resume_unwind(panic)
            }
            None => Err(ProvisioningError::TimedOut {
                timeout: self.config.run_timeout.unwrap_or_default(),
                teardown,
            }),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
