//! Error types for stagecheck.
//!
//! Provisioning failures abort a run after best-effort teardown and surface as
//! [`ProvisioningError`]. Probe timeouts and assertion failures are returned as
//! data instead; [`ProbeTimeoutError`] exists for callers that want to escalate.

use crate::provision::TeardownReport;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Why a `${stage.output}` reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No stage with that identifier exists in the run.
    UnknownStage,
    /// The stage exists but does not run strictly before the referencing stage.
    ForwardReference,
    /// The stage ran but did not produce the named output.
    UnknownOutput,
    /// The `config` namespace has no value under that name.
    UnknownConfig,
    /// The token is not of the form `${stage.output}`.
    Malformed,
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::UnknownStage => "no such stage",
            Self::ForwardReference => "stage does not run before the referencing stage",
            Self::UnknownOutput => "stage produced no such output",
            Self::UnknownConfig => "run configuration has no such value",
            Self::Malformed => "expected ${stage.output}",
        };
        f.write_str(text)
    }
}

/// Error raised when a stage input references a nonexistent or not-yet-produced output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' references '${{{reference}}}': {reason}")]
pub struct UnresolvedReferenceError {
    /// The stage (or probe/check) whose inputs hold the reference.
    pub stage: String,
    /// The reference body, without the `${` `}` delimiters.
    pub reference: String,
    /// Why resolution failed.
    pub reason: UnresolvedReason,
}

impl UnresolvedReferenceError {
    /// Creates a new unresolved reference error.
    #[must_use]
    pub fn new(stage: impl Into<String>, reference: impl Into<String>, reason: UnresolvedReason) -> Self {
        Self {
            stage: stage.into(),
            reference: reference.into(),
            reason,
        }
    }
}

/// Error raised when the provisioning collaborator reports a failed apply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' failed to apply")]
pub struct StageApplyError {
    /// The failing stage.
    pub stage: String,
    /// Raw output of the provisioning collaborator.
    pub raw_log: String,
}

impl StageApplyError {
    /// Creates a new stage apply error.
    #[must_use]
    pub fn new(stage: impl Into<String>, raw_log: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            raw_log: raw_log.into(),
        }
    }
}

/// Error recorded when releasing a stage's resources failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Teardown of stage '{stage}' failed")]
pub struct TeardownError {
    /// The stage whose teardown failed.
    pub stage: String,
    /// Raw output of the provisioning collaborator.
    pub raw_log: String,
}

/// Error raised when a stage plan is structurally invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PlanValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PlanValidationError {
    /// Creates a new plan validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when a stage's outputs are recorded twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Outputs for stage '{stage}' were already recorded")]
pub struct OutputConflictError {
    /// The stage name.
    pub stage: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self { stage: stage.into() }
    }
}

/// Invalid prober inputs.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProbeConfigError {
    /// The overall timeout is zero.
    #[error("probe timeout must be greater than zero")]
    ZeroTimeout,
    /// The per-attempt timeout is zero.
    #[error("per-attempt timeout must be greater than zero")]
    ZeroPerAttemptTimeout,
    /// The per-attempt timeout is longer than the overall timeout.
    #[error("per-attempt timeout {per_attempt:?} exceeds probe timeout {timeout:?}")]
    PerAttemptExceedsTimeout {
        /// The per-attempt timeout.
        per_attempt: Duration,
        /// The overall timeout.
        timeout: Duration,
    },
}

/// Errors produced while turning text into a probe target.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetParseError {
    /// The target still contains a `${...}` token.
    #[error("target '{0}' contains an unresolved reference")]
    Unresolved(String),
    /// The target is not a valid URL.
    #[error("target '{target}' is not a valid URL: {reason}")]
    InvalidUrl {
        /// The offending text.
        target: String,
        /// Parser message.
        reason: String,
    },
    /// The scheme is not http, https or tcp.
    #[error("unsupported probe scheme '{0}'")]
    UnsupportedScheme(String),
    /// The URL has no host.
    #[error("target '{0}' has no host")]
    MissingHost(String),
    /// A tcp target without a port.
    #[error("tcp target '{0}' has no port")]
    MissingPort(String),
    /// The body pattern is not a valid regex.
    #[error("invalid body pattern: {0}")]
    InvalidPattern(String),
}

/// Error produced when a health probe never became healthy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{target} didn't become healthy after {} seconds ({attempts} attempts, last error: {last_error})", timeout.as_secs_f64())]
pub struct ProbeTimeoutError {
    /// The probed target, rendered as a URL.
    pub target: String,
    /// The overall timeout.
    pub timeout: Duration,
    /// Number of attempts made.
    pub attempts: u32,
    /// Wall-clock time spent polling.
    pub elapsed: Duration,
    /// The last transport error or response mismatch.
    pub last_error: String,
}

/// Errors turning a planned probe into a resolved target.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbePlanError {
    /// The probe URL references an output that does not exist.
    #[error(transparent)]
    Unresolved(#[from] UnresolvedReferenceError),
    /// The resolved URL is not a valid target.
    #[error(transparent)]
    Target(#[from] TargetParseError),
    /// The timeouts are invalid.
    #[error(transparent)]
    Settings(#[from] ProbeConfigError),
}

/// Errors from the live-system query collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The query command could not be run or exited non-zero.
    #[error("query '{query}' failed: {message}")]
    Command {
        /// Rendered query.
        query: String,
        /// Captured error output.
        message: String,
    },
    /// The response was not valid JSON.
    #[error("query '{query}' returned invalid JSON: {message}")]
    Parse {
        /// Rendered query.
        query: String,
        /// Parser message.
        message: String,
    },
    /// The `select` path did not match the response.
    #[error("query '{query}' response has nothing at '{path}'")]
    Select {
        /// Rendered query.
        query: String,
        /// The selection path.
        path: String,
    },
    /// Assuming the configured role failed.
    #[error("could not assume role '{role_arn}': {message}")]
    Credentials {
        /// The role that was requested.
        role_arn: String,
        /// Captured error output.
        message: String,
    },
    /// The operation could change the system it observes.
    #[error("query '{query}' is not read-only; only describe-, list- and get- operations are allowed")]
    NotReadOnly {
        /// Rendered query.
        query: String,
    },
    /// The query parameters hold an unresolved reference.
    #[error("{0}")]
    Unresolved(#[from] UnresolvedReferenceError),
}

/// Errors found by checking a run plan before anything is provisioned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanCheckError {
    /// A probe or assertion references an unknown stage or output.
    #[error(transparent)]
    Unresolved(#[from] UnresolvedReferenceError),
    /// An assertion would run a query that is not read-only.
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Errors that abort an orchestrator run.
///
/// Every variant that happens after something was applied carries the report
/// of the teardown that followed.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The stage plan is structurally invalid; nothing was applied.
    #[error("{0}")]
    InvalidPlan(#[from] PlanValidationError),

    /// A stage input referenced something that does not exist (yet).
    #[error("{source}")]
    UnresolvedReference {
        /// The resolution failure.
        source: UnresolvedReferenceError,
        /// Teardown of the stages acquired before the failure.
        teardown: TeardownReport,
    },

    /// The provisioning collaborator reported failure.
    #[error("{source}")]
    StageApply {
        /// The apply failure.
        source: StageApplyError,
        /// Teardown of the stages acquired before the failure.
        teardown: TeardownReport,
    },

    /// The caller-supplied run timeout expired.
    #[error("Run timed out after {} seconds", timeout.as_secs_f64())]
    TimedOut {
        /// The run timeout.
        timeout: Duration,
        /// Teardown of every stage acquired or in flight at expiry.
        teardown: TeardownReport,
    },

    /// The run itself succeeded but releasing resources did not.
    #[error("Teardown failed for {} stage(s)", .0.failures().count())]
    Teardown(TeardownReport),
}

impl ProvisioningError {
    /// Returns the teardown report attached to this error, if any.
    #[must_use]
    pub fn teardown(&self) -> Option<&TeardownReport> {
        match self {
            Self::InvalidPlan(_) => None,
            Self::UnresolvedReference { teardown, .. }
            | Self::StageApply { teardown, .. }
            | Self::TimedOut { teardown, .. }
            | Self::Teardown(teardown) => Some(teardown),
        }
    }

    /// Returns the identifier of the stage that caused the failure, if any.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::UnresolvedReference { source, .. } => Some(&source.stage),
            Self::StageApply { source, .. } => Some(&source.stage),
            _ => None,
        }
    }

    /// Converts to a JSON representation for reports.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = match self {
            Self::InvalidPlan(err) => json!({
                "type": "PlanValidationError",
                "stages": err.stages,
            }),
            Self::UnresolvedReference { source, .. } => json!({
                "type": "UnresolvedReferenceError",
                "stage": source.stage,
                "reference": source.reference,
                "reason": source.reason.to_string(),
            }),
            Self::StageApply { source, .. } => json!({
                "type": "StageApplyError",
                "stage": source.stage,
                "raw_log": source.raw_log,
            }),
            Self::TimedOut { timeout, .. } => json!({
                "type": "RunTimeout",
                "timeout_seconds": timeout.as_secs_f64(),
            }),
            Self::Teardown(_) => json!({ "type": "TeardownError" }),
        };
        value["message"] = json!(self.to_string());
        if let Some(teardown) = self.teardown() {
            value["teardown"] = teardown.to_json();
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::TeardownOutcome;

    #[test]
    fn test_unresolved_reference_message() {
        let err = UnresolvedReferenceError::new("compute", "network.vpc_id", UnresolvedReason::UnknownOutput);
        assert_eq!(
            err.to_string(),
            "Stage 'compute' references '${network.vpc_id}': stage produced no such output"
        );
    }

    #[test]
    fn test_probe_timeout_message_names_everything() {
        let err = ProbeTimeoutError {
            target: "http://example.invalid/".to_string(),
            timeout: Duration::from_secs(3),
            attempts: 2,
            elapsed: Duration::from_secs(3),
            last_error: "connection refused".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("http://example.invalid/"));
        assert!(message.contains("3 seconds"));
        assert!(message.contains("2 attempts"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_stage_apply_error_to_json() {
        let mut teardown = TeardownReport::default();
        teardown.push("network", TeardownOutcome::Destroyed);
        let err = ProvisioningError::StageApply {
            source: StageApplyError::new("compute", "Error: quota exceeded"),
            teardown,
        };

        let value = err.to_json();
        assert_eq!(value["type"], "StageApplyError");
        assert_eq!(value["stage"], "compute");
        assert_eq!(value["raw_log"], "Error: quota exceeded");
        assert_eq!(value["teardown"]["stages"][0]["stage"], "network");
        assert_eq!(err.failed_stage(), Some("compute"));
    }

    #[test]
    fn test_invalid_plan_has_no_teardown() {
        let err = ProvisioningError::from(PlanValidationError::new("empty plan"));
        assert!(err.teardown().is_none());
        assert!(err.failed_stage().is_none());
    }
}
