//! Acquired-stage stack and teardown reporting.

use super::{Provisioner, StageSpec};
use crate::errors::TeardownError;
use crate::events::{event_types, EventSink};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tracing::{error, info};

/// What happened to one stage during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The stage's resources were released.
    Destroyed,
    /// Release was skipped because the stage or the run asked to keep resources.
    Retained,
    /// Release failed.
    Failed {
        /// Raw collaborator output.
        raw_log: String,
    },
}

impl TeardownOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Destroyed => "destroyed",
            Self::Retained => "retained",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Every teardown outcome of a run, in the order teardown happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    entries: Vec<(String, TeardownOutcome)>,
}

impl TeardownReport {
    /// Appends an outcome.
    pub fn push(&mut self, stage: impl Into<String>, outcome: TeardownOutcome) {
        self.entries.push((stage.into(), outcome));
    }

    /// Returns every outcome in teardown order.
    #[must_use]
    pub fn entries(&self) -> &[(String, TeardownOutcome)] {
        &self.entries
    }

    /// Returns the stage identifiers in teardown order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.entries.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// Returns the outcome for a stage.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<&TeardownOutcome> {
        self.entries.iter().find(|(s, _)| s == stage).map(|(_, o)| o)
    }

    /// Iterates over the failed releases.
    pub fn failures(&self) -> impl Iterator<Item = TeardownError> + '_ {
        self.entries.iter().filter_map(|(stage, outcome)| match outcome {
            TeardownOutcome::Failed { raw_log } => Some(TeardownError {
                stage: stage.clone(),
                raw_log: raw_log.clone(),
            }),
            _ => None,
        })
    }

    /// Returns true if no release failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Returns true if nothing was torn down.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts to a JSON representation for reports.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let stages: Vec<_> = self
            .entries
            .iter()
            .map(|(stage, outcome)| {
                let mut entry = json!({ "stage": stage, "outcome": outcome.label() });
                if let TeardownOutcome::Failed { raw_log } = outcome {
                    entry["raw_log"] = json!(raw_log);
                }
                entry
            })
            .collect();
        json!({ "clean": self.is_clean(), "stages": stages })
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
    Applying,
    Applied,
}

#[derive(Debug, Clone)]
struct AcquiredStage {
    id: String,
    workdir: PathBuf,
    retain: bool,
    state: StageState,
}

/// Stages acquired during a run, released in reverse order of acquisition.
#[derive(Debug, Default)]
pub struct AcquiredStack {
    stages: Vec<AcquiredStage>,
}

impl AcquiredStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `spec` is about to be applied.
    ///
    /// An in-flight stage is released along with the rest if the run is
    /// abandoned mid-apply.
    pub fn begin(&mut self, spec: &StageSpec) {
        self.stages.push(AcquiredStage {
            id: spec.id.clone(),
            workdir: spec.workdir.clone(),
            retain: spec.retain,
            state: StageState::Applying,
        });
    }

    /// Marks the in-flight stage as applied.
    pub fn complete(&mut self) {
        if let Some(top) = self.stages.last_mut() {
            top.state = StageState::Applied;
        }
    }

    /// Forgets the in-flight stage after its apply reported failure.
    pub fn abandon(&mut self) {
        if self.stages.last().is_some_and(|s| s.state == StageState::Applying) {
            self.stages.pop();
        }
    }

    /// Returns acquired stage identifiers in acquisition order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// Returns the number of acquired stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is acquired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Releases every stage, newest first.
    ///
    /// All stages are attempted even when some fail or panic; each outcome is
    /// recorded. Stages marked `retain`, or every stage when `keep_after` is
    /// set, are skipped and reported as retained. The stack is empty afterwards.
    pub async fn release_all(
        &mut self,
        provisioner: &dyn Provisioner,
        keep_after: bool,
        sink: &dyn EventSink,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();

        while let Some(stage) = self.stages.pop() {
            if keep_after || stage.retain {
                info!(stage = %stage.id, workdir = %stage.workdir.display(), "Keeping stage resources");
                sink.try_emit(event_types::STAGE_RETAINED, Some(json!({ "stage": stage.id })));
                report.push(stage.id, TeardownOutcome::Retained);
                continue;
            }

            info!(stage = %stage.id, "Destroying stage");
            let destroyed = AssertUnwindSafe(provisioner.destroy(&stage.workdir))
                .catch_unwind()
                .await;

            let outcome = match destroyed {
                Ok(outcome) if outcome.success => {
                    sink.try_emit(event_types::STAGE_DESTROYED, Some(json!({ "stage": stage.id })));
                    TeardownOutcome::Destroyed
                }
                Ok(outcome) => {
                    error!(stage = %stage.id, "Teardown failed:\n{}", outcome.raw_log);
                    sink.try_emit(event_types::STAGE_TEARDOWN_FAILED, Some(json!({ "stage": stage.id })));
                    TeardownOutcome::Failed {
                        raw_log: outcome.raw_log,
                    }
                }
                Err(panic) => {
                    let raw_log = format!("teardown panicked: {}", panic_message(panic.as_ref()));
                    error!(stage = %stage.id, "{}", raw_log);
                    sink.try_emit(event_types::STAGE_TEARDOWN_FAILED, Some(json!({ "stage": stage.id })));
                    TeardownOutcome::Failed { raw_log }
                }
            };
            report.push(stage.id, outcome);
        }

        report
    }
}
