//! Core domain model types for stagecheck.
//!
//! This module contains the Stage Output Store:
//! - Stage output values as reported by the provisioning collaborator
//! - The append-only store of outputs captured during a run
//! - `${stage.output}` reference checking and resolution

mod output;
mod reference;
mod store;

pub use output::{OutputValue, StageOutput, REDACTED};
pub use reference::{
    check_order, has_references, reference_bodies, references_in, Reference, Resolver,
};
pub use store::StageOutputs;
