//! Testing utilities.
//!
//! This module provides scripted stand-ins for the external collaborators:
//! - A probe attempt with canned outcomes
//! - A provisioner that records applies and destroys
//! - A live-query collaborator answering from canned responses

mod mocks;

pub use mocks::{RecordingProvisioner, ScriptedAttempt, StaticLiveQuery};
