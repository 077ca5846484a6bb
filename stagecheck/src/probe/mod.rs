//! Health Prober.
//!
//! This module provides:
//! - Probe targets (`http`, `https`, `tcp`) with an expected-response predicate
//! - The poll state machine (`Polling -> Healthy | TimedOut`)
//! - A prober that drives the state machine over the network

mod poll;
mod prober;
mod target;

pub use poll::{
    reports_progress, PollDecision, ProbeResult, ProbeSettings, DEFAULT_BACKOFF, PROGRESS_EVERY,
};
pub use prober::{NetworkAttempt, ProbeAttempt, Prober};
pub use target::{BodyMatch, ExpectedResponse, ProbeTarget, Protocol};
