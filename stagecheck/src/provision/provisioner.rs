//! The provisioning collaborator.

use super::InputVars;
use crate::core::OutputValue;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Result of applying a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Whether the apply succeeded.
    pub success: bool,
    /// Outputs reported by the collaborator (empty on failure).
    pub outputs: BTreeMap<String, OutputValue>,
    /// Raw collaborator output.
    pub raw_log: String,
}

impl ApplyOutcome {
    /// A successful apply.
    #[must_use]
    pub fn succeeded(outputs: BTreeMap<String, OutputValue>, raw_log: impl Into<String>) -> Self {
        Self {
            success: true,
            outputs,
            raw_log: raw_log.into(),
        }
    }

    /// A failed apply.
    #[must_use]
    pub fn failed(raw_log: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: BTreeMap::new(),
            raw_log: raw_log.into(),
        }
    }
}

/// Result of destroying a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOutcome {
    /// Whether the resources were released.
    pub success: bool,
    /// Raw collaborator output.
    pub raw_log: String,
}

impl DestroyOutcome {
    /// A successful destroy.
    #[must_use]
    pub fn succeeded(raw_log: impl Into<String>) -> Self {
        Self {
            success: true,
            raw_log: raw_log.into(),
        }
    }

    /// A failed destroy.
    #[must_use]
    pub fn failed(raw_log: impl Into<String>) -> Self {
        Self {
            success: false,
            raw_log: raw_log.into(),
        }
    }
}

/// Turns stage inputs into real infrastructure and releases it again.
///
/// The orchestrator treats implementations as opaque: failures are reported
/// through the outcome, never by panicking.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Acquires the resources described in `workdir` with the given inputs.
    async fn apply(&self, workdir: &Path, inputs: &InputVars) -> ApplyOutcome;

    /// Releases the resources previously acquired in `workdir`.
    async fn destroy(&self, workdir: &Path) -> DestroyOutcome;
}
