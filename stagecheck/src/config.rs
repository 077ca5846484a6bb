//! Run configuration.
//!
//! A [`RunConfig`] is built once per verification run and shared immutably with
//! the orchestrator, the provisioner and the verifier. Its values are also
//! addressable from stage inputs as `${config.<name>}`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference namespace that resolves against the run configuration.
pub const CONFIG_NAMESPACE: &str = "config";

fn default_region() -> String {
    "us-east-2".to_string()
}

/// Immutable settings for one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// AWS region the stages provision into.
    #[serde(default = "default_region")]
    pub region: String,
    /// Role to assume for provisioning and queries.
    #[serde(default)]
    pub role_arn: Option<String>,
    /// Skip teardown so resources survive the run.
    #[serde(default)]
    pub keep_after: bool,
    /// DNS zone name the stages publish records in.
    #[serde(default)]
    pub test_zone: Option<String>,
    /// Hosted zone identifier, for stages that take the zone by id.
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Provider version constraint written into each stage's `terraform.tf`.
    #[serde(default)]
    pub provider_version: Option<String>,
    /// Upper bound on provisioning plus verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            role_arn: None,
            keep_after: false,
            test_zone: None,
            zone_id: None,
            provider_version: None,
            run_timeout: None,
        }
    }
}

impl RunConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets the role to assume.
    #[must_use]
    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    /// Keeps resources after the run.
    #[must_use]
    pub fn with_keep_after(mut self, keep_after: bool) -> Self {
        self.keep_after = keep_after;
        self
    }

    /// Sets the DNS zone name.
    #[must_use]
    pub fn with_test_zone(mut self, zone: impl Into<String>) -> Self {
        self.test_zone = Some(zone.into());
        self
    }

    /// Sets the hosted zone identifier.
    #[must_use]
    pub fn with_zone_id(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    /// Sets the provider version constraint.
    #[must_use]
    pub fn with_provider_version(mut self, constraint: impl Into<String>) -> Self {
        self.provider_version = Some(constraint.into());
        self
    }

    /// Bounds the whole run.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Looks up a value in the `config` reference namespace.
    ///
    /// Unset optional values are treated as missing.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<serde_json::Value> {
        let text = match name {
            "region" => Some(self.region.as_str()),
            "role_arn" => self.role_arn.as_deref(),
            "test_zone" => self.test_zone.as_deref(),
            "zone_id" => self.zone_id.as_deref(),
            "provider_version" => self.provider_version.as_deref(),
            "keep_after" => return Some(serde_json::Value::Bool(self.keep_after)),
            _ => None,
        };
        text.map(|t| serde_json::Value::String(t.to_string()))
    }
}
