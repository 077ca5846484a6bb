//! Run plans loaded from JSON.
//!
//! A plan lists the stages to provision, the endpoints to probe once they are
//! up, and the assertions to verify:
//!
//! ```json
//! {
//!   "stages": [
//!     { "id": "network", "workdir": "test_data/service-network" },
//!     { "id": "httpd", "workdir": "test_data/httpd",
//!       "inputs": { "subnet_id": "${network.subnet_id}" } }
//!   ],
//!   "probes": [{ "url": "http://${httpd.public_dns}/", "body": "Hello" }],
//!   "checks": []
//! }
//! ```

use crate::config::RunConfig;
use crate::core::{check_order, Resolver, StageOutputs};
use crate::errors::{PlanCheckError, ProbePlanError};
use crate::probe::{ProbeSettings, ProbeTarget};
use crate::provision::StageSpec;
use crate::verify::{AssertionSource, AssertionSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

fn default_status() -> u16 {
    200
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_per_attempt_timeout_secs() -> u64 {
    5
}

/// An endpoint to probe after provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbePlan {
    /// Target URL (`http`, `https` or `tcp`); may hold references.
    pub url: String,
    /// Expected HTTP status.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Expected exact body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Expected body pattern (regex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_pattern: Option<String>,
    /// Overall probe timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout of each attempt.
    #[serde(default = "default_per_attempt_timeout_secs")]
    pub per_attempt_timeout_secs: u64,
}

impl ProbePlan {
    /// Creates a plan for `url` with default expectations and timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: default_status(),
            body: None,
            body_pattern: None,
            timeout_secs: default_timeout_secs(),
            per_attempt_timeout_secs: default_per_attempt_timeout_secs(),
        }
    }

    /// Resolves the URL against captured outputs and builds the probe.
    pub fn resolve(
        &self,
        outputs: &StageOutputs,
        config: &RunConfig,
    ) -> Result<(ProbeTarget, ProbeSettings), ProbePlanError> {
        let url = Resolver::new(outputs, config, "probe").resolve_str(&self.url)?;
        let mut target = ProbeTarget::parse(&url)?.with_status(self.status);
        if let Some(body) = &self.body {
            target = target.with_exact_body(body.clone());
        }
        if let Some(pattern) = &self.body_pattern {
            target = target.with_body_pattern(pattern)?;
        }
        let settings = ProbeSettings::new(
            Duration::from_secs(self.timeout_secs),
            Duration::from_secs(self.per_attempt_timeout_secs),
        )?;
        Ok((target, settings))
    }
}

/// Stages, probes and checks of one verification run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    /// Stages, in run order.
    pub stages: Vec<StageSpec>,
    /// Endpoints probed concurrently after the last stage.
    #[serde(default)]
    pub probes: Vec<ProbePlan>,
    /// Assertions verified after probing.
    #[serde(default)]
    pub checks: Vec<AssertionSpec>,
}

impl RunPlan {
    /// Parses a plan from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Reads a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid plan {}", path.display()))
    }

    /// Checks that probes and checks only reference stages of this plan or
    /// configured values, and that every query is read-only.
    pub fn check_references(&self, config: &RunConfig) -> Result<(), PlanCheckError> {
        let ids: Vec<&str> = self.stages.iter().map(|s| s.id.as_str()).collect();
        for probe in &self.probes {
            check_order("probe", &Value::String(probe.url.clone()), &ids, &[], config)?;
        }
        for check in &self.checks {
            let source = match &check.source {
                AssertionSource::Describe(query) | AssertionSource::List(query) => {
                    query.ensure_read_only()?;
                    Value::Object(query.params.clone())
                }
                AssertionSource::Output { reference } => Value::String(reference.clone()),
            };
            let value = Value::Array(vec![source, check.check.expected()]);
            check_order(&check.name, &value, &ids, &[], config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutput;
    use crate::errors::{QueryError, TargetParseError, UnresolvedReason};
    use crate::probe::Protocol;
    use crate::verify::{Check, ResourceQuery};
    use serde_json::json;

    const PLAN: &str = r#"{
        "stages": [
            { "id": "network", "workdir": "test_data/service-network" },
            { "id": "httpd", "workdir": "test_data/httpd",
              "inputs": { "subnet_id": "${network.subnet_id}" }, "retain": true }
        ],
        "probes": [
            { "url": "http://${httpd.public_dns}:8080/", "body": "Hello, World", "timeout_secs": 60 }
        ],
        "checks": [
            { "name": "subnet output",
              "source": { "kind": "output", "reference": "${network.subnet_id}" },
              "check": { "op": "equals", "expected": "subnet-abc" } }
        ]
    }"#;

    #[test]
    fn test_parse_plan() {
        let plan = RunPlan::from_json(PLAN).unwrap();

        assert_eq!(plan.stages.len(), 2);
        assert!(plan.stages[1].retain);
        assert_eq!(plan.stages[1].inputs["subnet_id"], json!("${network.subnet_id}"));
        assert_eq!(plan.probes[0].status, 200);
        assert_eq!(plan.probes[0].per_attempt_timeout_secs, 5);
        assert_eq!(plan.checks[0].name, "subnet output");
        assert!(plan.check_references(&RunConfig::new()).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunPlan::load(Path::new("/nonexistent/plan.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read plan"));
    }

    #[test]
    fn test_probe_resolves_against_outputs() {
        let plan = RunPlan::from_json(PLAN).unwrap();
        let mut outputs = StageOutputs::new();
        outputs
            .record(StageOutput::from_values("httpd", [("public_dns", json!("ec2-1.example.com"))]))
            .unwrap();

        let (target, settings) = plan.probes[0].resolve(&outputs, &RunConfig::new()).unwrap();

        assert_eq!(target.protocol(), Protocol::Http);
        assert_eq!(target.host(), "ec2-1.example.com");
        assert_eq!(target.port(), 8080);
        assert_eq!(settings.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_probe_errors() {
        let outputs = StageOutputs::new();
        let config = RunConfig::new();

        let err = ProbePlan::new("http://${httpd.public_dns}/").resolve(&outputs, &config).unwrap_err();
        assert!(matches!(err, ProbePlanError::Unresolved(_)));

        let err = ProbePlan::new("ftp://example.com/").resolve(&outputs, &config).unwrap_err();
        assert_eq!(err, ProbePlanError::Target(TargetParseError::UnsupportedScheme("ftp".to_string())));

        let mut plan = ProbePlan::new("tcp://example.com:22");
        plan.per_attempt_timeout_secs = 600;
        assert!(matches!(plan.resolve(&outputs, &config), Err(ProbePlanError::Settings(_))));
    }

    #[test]
    fn test_check_references_rejects_unknown_stage() {
        let mut plan = RunPlan::from_json(PLAN).unwrap();
        plan.probes[0].url = "http://${dns.fqdn}/".to_string();

        let err = match plan.check_references(&RunConfig::new()).unwrap_err() {
            PlanCheckError::Unresolved(err) => err,
            other => panic!("unexpected error: {other:?}"),
        };
        assert_eq!(err.reason, UnresolvedReason::UnknownStage);
        assert_eq!(err.reference, "dns.fqdn");
    }

    #[test]
    fn test_check_references_covers_expected_values() {
        let mut plan = RunPlan::from_json(PLAN).unwrap();
        plan.checks[0].check = Check::equals("", json!("${gateway.subnet_id}"));

        let err = plan.check_references(&RunConfig::new()).unwrap_err();
        assert!(matches!(
            err,
            PlanCheckError::Unresolved(ref e) if e.reference == "gateway.subnet_id"
        ));
    }

    #[test]
    fn test_check_references_rejects_mutating_query() {
        let mut plan = RunPlan::from_json(PLAN).unwrap();
        plan.checks.push(AssertionSpec::describe(
            "terminate",
            ResourceQuery::new("ec2", "terminate-instances"),
            Check::length("", 0),
        ));

        let err = plan.check_references(&RunConfig::new()).unwrap_err();
        assert_eq!(
            err,
            PlanCheckError::Query(QueryError::NotReadOnly {
                query: "ec2 terminate-instances".to_string()
            })
        );
    }
}
