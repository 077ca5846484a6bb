//! Multi-stage provisioning.
//!
//! Stages are applied one after another through a [`Provisioner`], each
//! stage's outputs feeding the inputs of the stages after it. Everything that
//! was acquired is released newest first when the run ends.

mod orchestrator;
mod provisioner;
mod stage;
mod teardown;
pub mod terraform;
mod tfvars;

pub use orchestrator::{Deployment, Orchestrator, RunOutcome};
pub use provisioner::{ApplyOutcome, DestroyOutcome, Provisioner};
pub use stage::{InputVars, StageSpec};
pub use teardown::{AcquiredStack, TeardownOutcome, TeardownReport};
pub use terraform::TerraformProvisioner;
pub use tfvars::render_tfvars;
