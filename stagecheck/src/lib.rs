//! # Stagecheck
//!
//! Provisions layered infrastructure one stage at a time, waits for what it
//! built to become reachable, verifies it against the live system, and tears
//! everything down again.
//!
//! Stagecheck provides:
//!
//! - **Multi-stage orchestration**: stages run in order and feed their outputs
//!   to later stages through `${stage.output}` references
//! - **Guaranteed teardown**: acquired stages are released newest first on
//!   success, failure, panic or timeout
//! - **Health probing**: bounded HTTP and TCP readiness polling
//! - **Post-provision verification**: read-only assertions that report every
//!   discrepancy, not just the first
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagecheck::prelude::*;
//!
//! let stages = vec![
//!     StageSpec::new("network", "test_data/service-network"),
//!     StageSpec::new("compute", "test_data/httpd")
//!         .with_input("subnet_id", json!("${network.subnet_id}")),
//! ];
//!
//! let orchestrator = Orchestrator::new(Arc::new(TerraformProvisioner::new()), RunConfig::new());
//! let outcome = orchestrator
//!     .run_scoped(&stages, |outputs| async move { verifier.verify(&outputs, &checks).await })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod plan;
pub mod probe;
pub mod provision;
pub mod testing;
pub mod verify;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::RunConfig;
    pub use crate::core::{OutputValue, StageOutput, StageOutputs};
    pub use crate::errors::{
        ProbeTimeoutError, ProvisioningError, StageApplyError, TeardownError,
        UnresolvedReferenceError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::plan::{ProbePlan, RunPlan};
    pub use crate::probe::{ProbeResult, ProbeSettings, ProbeTarget, Prober};
    pub use crate::provision::{
        Orchestrator, Provisioner, RunOutcome, StageSpec, TeardownReport,
        TerraformProvisioner,
    };
    pub use crate::verify::{
        AssertionSpec, AwsCliQuery, Check, LiveQuery, ResourceQuery, VerificationReport,
        Verifier,
    };
}
