//! Post-provision verification.
//!
//! Assertions read the live system through a [`LiveQuery`] collaborator, or
//! read the captured stage outputs, and compare what they find with what the
//! stages were meant to build.

mod assertion;
mod path;
mod query;
mod verifier;

pub use assertion::{AssertionSource, AssertionSpec, Check, Comparison};
pub use path::select;
#[cfg(test)]
pub use query::MockLiveQuery;
pub use query::{AwsCliQuery, LiveQuery, ResourceQuery, READ_ONLY_PREFIXES};
pub use verifier::{AssertionOutcome, VerificationReport, Verifier};
