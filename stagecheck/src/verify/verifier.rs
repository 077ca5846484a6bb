//! The Post-Provision Verifier.

use super::assertion::{AssertionSource, AssertionSpec, Comparison};
use super::query::LiveQuery;
use crate::config::RunConfig;
use crate::core::{Resolver, StageOutputs};
use crate::errors::QueryError;
use crate::events::{event_types, EventSink, NoOpEventSink};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionOutcome {
    /// Assertion name.
    pub name: String,
    /// Whether it held.
    pub passed: bool,
    /// Expected value.
    pub expected: Value,
    /// Observed value, `null` when nothing could be observed.
    pub actual: Value,
    /// Human-readable description naming expected and actual values.
    pub diagnostic: String,
}

/// Aggregate result of a verification pass.
///
/// Holds no timestamps, so verifying an unchanged system twice yields equal reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    /// Number of assertions evaluated.
    pub total: usize,
    /// Number that held.
    pub passed: usize,
    /// Number that did not.
    pub failed: usize,
    /// Every outcome, in assertion order.
    pub outcomes: Vec<AssertionOutcome>,
}

impl VerificationReport {
    fn push(&mut self, outcome: AssertionOutcome) {
        self.total += 1;
        if outcome.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Returns true if every assertion held.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Iterates over the failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &AssertionOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}

/// Runs assertions against the live system without changing it.
#[derive(Clone)]
pub struct Verifier {
    query: Arc<dyn LiveQuery>,
    config: Arc<RunConfig>,
    sink: Arc<dyn EventSink>,
    settle_attempts: u32,
    settle_delay: Duration,
}

impl Verifier {
    /// Creates a verifier that evaluates each assertion once.
    pub fn new(query: Arc<dyn LiveQuery>, config: RunConfig) -> Self {
        Self {
            query,
            config: Arc::new(config),
            sink: Arc::new(NoOpEventSink),
            settle_attempts: 1,
            settle_delay: Duration::ZERO,
        }
    }

    /// Sets the sink that receives one event per assertion.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Re-evaluates a failing assertion up to `attempts` times, `delay` apart.
    ///
    /// Gives eventually consistent APIs time to catch up.
    #[must_use]
    pub fn with_settle(mut self, attempts: u32, delay: Duration) -> Self {
        self.settle_attempts = attempts.max(1);
        self.settle_delay = delay;
        self
    }

    /// Evaluates every assertion in order and aggregates the outcomes.
    ///
    /// A failing assertion never stops the ones after it.
    pub async fn verify(&self, outputs: &StageOutputs, checks: &[AssertionSpec]) -> VerificationReport {
        let mut report = VerificationReport::default();
        for spec in checks {
            let outcome = self.evaluate_settled(outputs, spec).await;
            if outcome.passed {
                info!(assertion = %outcome.name, "Assertion passed: {}", outcome.diagnostic);
            } else {
                warn!(assertion = %outcome.name, "Assertion failed: {}", outcome.diagnostic);
            }
            self.sink
                .emit(
                    event_types::ASSERTION_EVALUATED,
                    Some(json!({ "name": outcome.name, "passed": outcome.passed })),
                )
                .await;
            report.push(outcome);
        }
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            "Verification finished"
        );
        report
    }

    async fn evaluate_settled(&self, outputs: &StageOutputs, spec: &AssertionSpec) -> AssertionOutcome {
        let mut attempt = 1;
        loop {
            let outcome = self.evaluate(outputs, spec).await;
            if outcome.passed || attempt >= self.settle_attempts {
                return outcome;
            }
            attempt += 1;
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    async fn evaluate(&self, outputs: &StageOutputs, spec: &AssertionSpec) -> AssertionOutcome {
        let resolver = Resolver::new(outputs, &self.config, &spec.name);
        let Comparison {
            passed,
            expected,
            actual,
            diagnostic,
        } = match spec.check.resolve(&resolver) {
            Ok(check) => match self.observe(&resolver, &spec.source).await {
                Ok(root) => check.compare(&root),
                Err(err) => unobserved(check.expected(), &err),
            },
            Err(err) => unobserved(spec.check.expected(), &err),
        };
        AssertionOutcome {
            name: spec.name.clone(),
            passed,
            expected,
            actual,
            diagnostic,
        }
    }

    async fn observe(&self, resolver: &Resolver<'_>, source: &AssertionSource) -> Result<Value, QueryError> {
        match source {
            AssertionSource::Describe(query) => {
                let query = query.resolve(resolver)?;
                query.ensure_read_only()?;
                self.query.describe(&query).await
            }
            AssertionSource::List(query) => {
                let query = query.resolve(resolver)?;
                query.ensure_read_only()?;
                self.query.list(&query).await.map(Value::Array)
            }
            AssertionSource::Output { reference } => {
                Ok(resolver.resolve(&Value::String(reference.clone()))?)
            }
        }
    }
}

/// A failed comparison for an assertion whose actual value could not be read.
fn unobserved(expected: Value, err: &dyn std::error::Error) -> Comparison {
    let diagnostic = format!("{err}; expected {expected}");
    Comparison {
        passed: false,
        expected,
        actual: Value::Null,
        diagnostic,
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("settle_attempts", &self.settle_attempts)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutput;
    use crate::testing::StaticLiveQuery;
    use crate::verify::{Check, MockLiveQuery, ResourceQuery};
    use pretty_assertions::assert_eq;

    fn outputs() -> StageOutputs {
        let mut outputs = StageOutputs::new();
        outputs
            .record(StageOutput::from_values(
                "network",
                [
                    ("vpc_id", json!("vpc-1")),
                    ("subnet_private_ids", json!(["subnet-1", "subnet-2"])),
                ],
            ))
            .unwrap();
        outputs
    }

    fn describe_vpcs() -> ResourceQuery {
        ResourceQuery::new("ec2", "describe-vpcs")
            .with_param("VpcIds", json!(["${network.vpc_id}"]))
            .with_select("Vpcs.0")
    }

    fn live() -> StaticLiveQuery {
        StaticLiveQuery::new()
            .with_describe(
                "describe-vpcs",
                json!({ "Vpcs": [{ "VpcId": "vpc-1", "CidrBlock": "10.0.0.0/16" }] }),
            )
            .with_list(
                "describe-subnets",
                vec![json!({ "SubnetId": "subnet-1" }), json!({ "SubnetId": "subnet-2" })],
            )
    }

    fn checks() -> Vec<AssertionSpec> {
        vec![
            AssertionSpec::describe("vpc exists", describe_vpcs(), Check::equals("VpcId", json!("vpc-1"))),
            AssertionSpec::describe(
                "vpc cidr",
                describe_vpcs(),
                Check::equals("CidrBlock", json!("10.2.0.0/16")),
            ),
            AssertionSpec::list(
                "subnet count",
                ResourceQuery::new("ec2", "describe-subnets"),
                Check::length("", 2),
            ),
        ]
    }

    #[tokio::test]
    async fn test_second_of_three_fails() {
        let verifier = Verifier::new(Arc::new(live()), RunConfig::new());

        let report = verifier.verify(&outputs(), &checks()).await;

        assert_eq!((report.total, report.passed, report.failed), (3, 2, 1));
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "vpc cidr");
        assert_eq!(failures[0].expected, json!("10.2.0.0/16"));
        assert_eq!(failures[0].actual, json!("10.0.0.0/16"));
        assert!(failures[0].diagnostic.contains("10.2.0.0/16"));
        assert!(failures[0].diagnostic.contains("10.0.0.0/16"));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_query_params_are_resolved() {
        let live = Arc::new(live());
        let verifier = Verifier::new(live.clone(), RunConfig::new());

        verifier.verify(&outputs(), &checks()[..1]).await;

        assert_eq!(live.calls()[0].params["VpcIds"], json!(["vpc-1"]));
    }

    #[tokio::test]
    async fn test_verify_is_idempotent() {
        let verifier = Verifier::new(Arc::new(live()), RunConfig::new());

        let first = verifier.verify(&outputs(), &checks()).await;
        let second = verifier.verify(&outputs(), &checks()).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_output_assertions_and_errors_do_not_stop_others() {
        let verifier = Verifier::new(Arc::new(StaticLiveQuery::new()), RunConfig::new());
        let checks = vec![
            AssertionSpec::output("two subnets", "${network.subnet_private_ids}", Check::length("", 2)),
            AssertionSpec::output("missing output", "${network.gateway_id}", Check::equals("", json!("igw-1"))),
            AssertionSpec::describe("no response", describe_vpcs(), Check::equals("VpcId", json!("vpc-1"))),
            AssertionSpec::output("region", "${config.region}", Check::equals("", json!("us-east-2"))),
        ];

        let report = verifier.verify(&outputs(), &checks).await;

        let passed: Vec<bool> = report.outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![true, false, false, true]);
        assert!(report.outcomes[1].diagnostic.contains("network.gateway_id"));
        assert!(report.outcomes[2].diagnostic.contains("no canned response"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_retries_until_consistent() {
        let live = Arc::new(
            StaticLiveQuery::new()
                .with_describe("describe-vpcs", json!({ "Vpcs": [{ "VpcId": "vpc-1", "State": "pending" }] }))
                .with_describe("describe-vpcs", json!({ "Vpcs": [{ "VpcId": "vpc-1", "State": "available" }] })),
        );
        let verifier = Verifier::new(live.clone(), RunConfig::new()).with_settle(3, Duration::from_secs(5));
        let check = AssertionSpec::describe("vpc available", describe_vpcs(), Check::equals("State", json!("available")));

        let report = verifier.verify(&outputs(), &[check]).await;

        assert!(report.is_success());
        assert_eq!(live.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_with_mocked_live_query() {
        let mut query = MockLiveQuery::new();
        query
            .expect_list()
            .withf(|q| q.operation == "describe-instances")
            .times(1)
            .returning(|q| {
                Err(QueryError::Command {
                    query: q.to_string(),
                    message: "AccessDenied".to_string(),
                })
            });
        let verifier = Verifier::new(Arc::new(query), RunConfig::new());
        let check = AssertionSpec::list(
            "instances",
            ResourceQuery::new("ec2", "describe-instances"),
            Check::length("", 1),
        );

        let report = verifier.verify(&outputs(), &[check]).await;

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.outcomes[0].diagnostic,
            "query 'ec2 describe-instances' failed: AccessDenied; expected 1"
        );
        assert_eq!(report.outcomes[0].expected, json!(1));
    }

    #[tokio::test]
    async fn test_mutating_query_is_rejected_and_others_still_run() {
        let live = Arc::new(live().with_describe("terminate-instances", json!({})));
        let verifier = Verifier::new(live.clone(), RunConfig::new());
        let checks = vec![
            AssertionSpec::describe(
                "terminate",
                ResourceQuery::new("ec2", "terminate-instances").with_param("InstanceIds", json!(["i-1"])),
                Check::equals("", json!({})),
            ),
            checks().remove(0),
        ];

        let report = verifier.verify(&outputs(), &checks).await;

        assert_eq!((report.passed, report.failed), (1, 1));
        assert!(report.outcomes[0].diagnostic.contains("not read-only"));
        let operations: Vec<String> = live.calls().into_iter().map(|q| q.operation).collect();
        assert_eq!(operations, vec!["describe-vpcs"]);
    }

    #[tokio::test]
    async fn test_expected_value_resolves_against_outputs() {
        let mut outputs = outputs();
        outputs
            .record(StageOutput::from_values("httpd", [("target_group_arn", json!("arn:tg-1"))]))
            .unwrap();
        let live = StaticLiveQuery::new().with_describe(
            "describe-services",
            json!({ "services": [{ "loadBalancers": [{ "targetGroupArn": "arn:tg-1" }] }] }),
        );
        let verifier = Verifier::new(Arc::new(live), RunConfig::new());
        let check = AssertionSpec::describe(
            "service registered with target group",
            ResourceQuery::new("ecs", "describe-services").with_select("services.0"),
            Check::contains("loadBalancers.*.targetGroupArn", json!("${httpd.target_group_arn}")),
        );

        let report = verifier.verify(&outputs, &[check]).await;

        assert!(report.is_success(), "{:?}", report.outcomes);
        assert_eq!(report.outcomes[0].expected, json!("arn:tg-1"));
    }

    #[tokio::test]
    async fn test_unresolved_expected_value_fails_the_assertion() {
        let live = Arc::new(live());
        let verifier = Verifier::new(live.clone(), RunConfig::new());
        let check = AssertionSpec::describe(
            "vpc matches gateway",
            describe_vpcs(),
            Check::equals("VpcId", json!("${network.gateway_id}")),
        );

        let report = verifier.verify(&outputs(), &[check]).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes[0].expected, json!("${network.gateway_id}"));
        assert!(report.outcomes[0].diagnostic.contains("network.gateway_id"));
        assert!(live.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_reports_expected_value() {
        let verifier = Verifier::new(
            Arc::new(StaticLiveQuery::new().failing("describe-vpcs", "Throttling")),
            RunConfig::new(),
        );
        let check = AssertionSpec::describe("vpc available", describe_vpcs(), Check::equals("State", json!("available")));

        let report = verifier.verify(&outputs(), &[check]).await;

        let outcome = &report.outcomes[0];
        assert!(!outcome.passed);
        assert_eq!(outcome.expected, json!("available"));
        assert_eq!(outcome.actual, Value::Null);
        assert_eq!(
            outcome.diagnostic,
            "query 'ec2 describe-vpcs' failed: Throttling; expected \"available\""
        );
    }

    #[tokio::test]
    async fn test_unresolved_query_param_is_a_query_error() {
        let verifier = Verifier::new(Arc::new(live()), RunConfig::new());
        let outputs = StageOutputs::new();
        let resolver = Resolver::new(&outputs, &verifier.config, "vpc exists");

        let err = verifier
            .observe(&resolver, &AssertionSource::Describe(describe_vpcs()))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Unresolved(_)));
    }
}
