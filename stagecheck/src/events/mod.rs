//! Observability notifications.
//!
//! The orchestrator, prober and verifier report progress to an [`EventSink`].
//! Sinks are informational only: nothing they do feeds back into control flow.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event types emitted by stagecheck components.
pub mod event_types {
    /// A stage's apply is about to start.
    pub const STAGE_APPLY_STARTED: &str = "stage.apply.started";
    /// A stage applied and its outputs were captured.
    pub const STAGE_APPLY_COMPLETED: &str = "stage.apply.completed";
    /// A stage's apply failed.
    pub const STAGE_APPLY_FAILED: &str = "stage.apply.failed";
    /// A stage's resources were released.
    pub const STAGE_DESTROYED: &str = "stage.teardown.destroyed";
    /// A stage's resources were kept on purpose.
    pub const STAGE_RETAINED: &str = "stage.teardown.retained";
    /// Releasing a stage's resources failed.
    pub const STAGE_TEARDOWN_FAILED: &str = "stage.teardown.failed";
    /// Periodic probe progress.
    pub const PROBE_PROGRESS: &str = "probe.progress";
    /// A probe target became healthy.
    pub const PROBE_HEALTHY: &str = "probe.healthy";
    /// A probe gave up.
    pub const PROBE_TIMED_OUT: &str = "probe.timed_out";
    /// One verification assertion finished.
    pub const ASSERTION_EVALUATED: &str = "verify.assertion";
}
