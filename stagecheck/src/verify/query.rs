//! Read-only queries against the live system.

use super::path::select;
use crate::config::RunConfig;
use crate::core::Resolver;
use crate::errors::{QueryError, UnresolvedReferenceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

/// Operation name prefixes that only read state.
pub const READ_ONLY_PREFIXES: [&str; 3] = ["describe-", "list-", "get-"];

/// A typed read-only query, such as `ec2 describe-vpcs` with a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuery {
    /// Service namespace, e.g. `ec2`.
    pub service: String,
    /// Operation name, e.g. `describe-vpcs`.
    pub operation: String,
    /// Request parameters; may hold `${stage.output}` references.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Dotted path selecting part of the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
}

impl ResourceQuery {
    /// Creates a query with no parameters.
    #[must_use]
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            params: Map::new(),
            select: None,
        }
    }

    /// Adds a request parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Narrows the response to the value at `path`.
    #[must_use]
    pub fn with_select(mut self, path: impl Into<String>) -> Self {
        self.select = Some(path.into());
        self
    }

    /// Returns true if the operation only reads state.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        READ_ONLY_PREFIXES
            .iter()
            .any(|prefix| self.operation.starts_with(prefix))
    }

    /// Rejects operations that could change the live system.
    pub fn ensure_read_only(&self) -> Result<(), QueryError> {
        if self.is_read_only() {
            Ok(())
        } else {
            Err(QueryError::NotReadOnly {
                query: self.to_string(),
            })
        }
    }

    /// Returns a copy with every reference in the parameters resolved.
    pub fn resolve(&self, resolver: &Resolver<'_>) -> Result<Self, UnresolvedReferenceError> {
        let params = self
            .params
            .iter()
            .map(|(k, v)| resolver.resolve(v).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()?;
        Ok(Self {
            params,
            ..self.clone()
        })
    }

    /// Applies the `select` path to a raw response.
    pub fn select_from(&self, response: Value) -> Result<Value, QueryError> {
        match &self.select {
            None => Ok(response),
            Some(path) => select(&response, path).ok_or_else(|| QueryError::Select {
                query: self.to_string(),
                path: path.clone(),
            }),
        }
    }
}

impl std::fmt::Display for ResourceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.service, self.operation)
    }
}

/// The live-system query collaborator.
///
/// Implementations must not change the system they observe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiveQuery: Send + Sync {
    /// Describes resources, returning the (selected) response document.
    async fn describe(&self, query: &ResourceQuery) -> Result<Value, QueryError>;

    /// Lists resources, returning the (selected) response as records.
    async fn list(&self, query: &ResourceQuery) -> Result<Vec<Value>, QueryError>;
}

/// Temporary credentials exported to every query.
type Credentials = Vec<(&'static str, String)>;

/// Queries AWS through the `aws` command line.
#[derive(Debug)]
pub struct AwsCliQuery {
    binary: PathBuf,
    region: String,
    role_arn: Option<String>,
    credentials: OnceCell<Credentials>,
}

impl AwsCliQuery {
    /// Creates a query client for the configured region and role.
    #[must_use]
    pub fn new(config: &RunConfig) -> Self {
        Self {
            binary: PathBuf::from("aws"),
            region: config.region.clone(),
            role_arn: config.role_arn.clone(),
            credentials: OnceCell::new(),
        }
    }

    /// Uses a specific binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str], env: &Credentials) -> Result<Value, String> {
        let output = Command::new(&self.binary)
            .args(args)
            .args(["--output", "json", "--region", self.region.as_str()])
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.binary.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{}{}", stdout, stderr).trim().to_string());
        }
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| format!("invalid JSON: {e}"))
    }

    async fn assume_role(&self, role_arn: &str) -> Result<Credentials, QueryError> {
        let failed = |message: String| QueryError::Credentials {
            role_arn: role_arn.to_string(),
            message,
        };
        debug!(role_arn, "Assuming role for live queries");
        let response = self
            .run(
                &["sts", "assume-role", "--role-arn", role_arn, "--role-session-name", "stagecheck"],
                &Vec::new(),
            )
            .await
            .map_err(failed)?;

        let field = |name: &str| {
            response["Credentials"][name]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| failed(format!("response has no Credentials.{name}")))
        };
        Ok(vec![
            ("AWS_ACCESS_KEY_ID", field("AccessKeyId")?),
            ("AWS_SECRET_ACCESS_KEY", field("SecretAccessKey")?),
            ("AWS_SESSION_TOKEN", field("SessionToken")?),
        ])
    }

    async fn credentials(&self) -> Result<&Credentials, QueryError> {
        self.credentials
            .get_or_try_init(|| async {
                match &self.role_arn {
                    Some(role_arn) => self.assume_role(role_arn).await,
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    async fn query(&self, query: &ResourceQuery) -> Result<Value, QueryError> {
        query.ensure_read_only()?;
        let env = self.credentials().await?;
        let input = Value::Object(query.params.clone()).to_string();
        debug!(query = %query, input = %input, "Running live query");
        let response = self
            .run(
                &[
                    query.service.as_str(),
                    query.operation.as_str(),
                    "--cli-input-json",
                    input.as_str(),
                ],
                env,
            )
            .await
            .map_err(|message| {
                if message.starts_with("invalid JSON") {
                    QueryError::Parse {
                        query: query.to_string(),
                        message,
                    }
                } else {
                    QueryError::Command {
                        query: query.to_string(),
                        message,
                    }
                }
            })?;
        query.select_from(response)
    }
}

#[async_trait]
impl LiveQuery for AwsCliQuery {
    async fn describe(&self, query: &ResourceQuery) -> Result<Value, QueryError> {
        self.query(query).await
    }

    async fn list(&self, query: &ResourceQuery) -> Result<Vec<Value>, QueryError> {
        match self.query(query).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            _ => Err(QueryError::Select {
                query: query.to_string(),
                path: query.select.clone().unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageOutput, StageOutputs};
    use serde_json::json;

    #[test]
    fn test_resolve_params() {
        let mut outputs = StageOutputs::new();
        outputs
            .record(StageOutput::from_values("network", [("vpc_id", json!("vpc-1"))]))
            .unwrap();
        let config = RunConfig::new();
        let resolver = Resolver::new(&outputs, &config, "vpc check");

        let query = ResourceQuery::new("ec2", "describe-vpcs")
            .with_param("VpcIds", json!(["${network.vpc_id}"]))
            .resolve(&resolver)
            .unwrap();

        assert_eq!(query.params["VpcIds"], json!(["vpc-1"]));
    }

    #[test]
    fn test_only_read_operations_are_allowed() {
        for operation in ["describe-vpcs", "list-buckets", "get-bucket-policy"] {
            assert!(ResourceQuery::new("ec2", operation).ensure_read_only().is_ok(), "{operation}");
        }
        for operation in ["terminate-instances", "delete-vpc", "run-instances", "describe"] {
            let query = ResourceQuery::new("ec2", operation);
            assert_eq!(
                query.ensure_read_only(),
                Err(QueryError::NotReadOnly {
                    query: format!("ec2 {operation}")
                })
            );
        }
    }

    #[test]
    fn test_select_from() {
        let query = ResourceQuery::new("ec2", "describe-vpcs").with_select("Vpcs.0.VpcId");
        assert_eq!(
            query.select_from(json!({ "Vpcs": [{ "VpcId": "vpc-1" }] })).unwrap(),
            json!("vpc-1")
        );
        assert!(matches!(
            query.select_from(json!({ "Vpcs": [] })),
            Err(QueryError::Select { .. })
        ));
    }

    #[test]
    fn test_query_deserializes_from_plan_json() {
        let query: ResourceQuery = serde_json::from_value(json!({
            "service": "ec2",
            "operation": "describe-subnets",
            "params": { "Filters": [{ "Name": "vpc-id", "Values": ["${network.vpc_id}"] }] },
            "select": "Subnets"
        }))
        .unwrap();
        assert_eq!(query.to_string(), "ec2 describe-subnets");
        assert_eq!(query.select.as_deref(), Some("Subnets"));
    }

    #[cfg(unix)]
    fn fake_aws(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = r#"#!/bin/sh
echo "$1 $2" >> "$(dirname "$0")/calls.log"
case "$1 $2" in
  "sts assume-role")
    echo '{"Credentials":{"AccessKeyId":"AKIA","SecretAccessKey":"secret","SessionToken":"token"}}' ;;
  "ec2 describe-vpcs")
    echo "{\"Vpcs\":[{\"VpcId\":\"vpc-1\",\"Key\":\"$AWS_ACCESS_KEY_ID\"}]}" ;;
  *)
    echo "unknown operation $2" >&2; exit 255 ;;
esac
"#;
        let path = dir.join("aws");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_aws_cli_query_with_assumed_role() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RunConfig::new().with_role_arn("arn:aws:iam::123456789012:role/test");
        let client = AwsCliQuery::new(&config).with_binary(fake_aws(dir.path()));

        let vpcs = client
            .list(&ResourceQuery::new("ec2", "describe-vpcs").with_select("Vpcs"))
            .await
            .unwrap();
        assert_eq!(vpcs.len(), 1);
        assert_eq!(vpcs[0]["Key"], json!("AKIA"));

        let err = client
            .describe(&ResourceQuery::new("ec2", "describe-nothing"))
            .await
            .unwrap_err();
        match err {
            QueryError::Command { message, .. } => assert!(message.contains("unknown operation")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mutating_operation_never_reaches_the_cli() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = AwsCliQuery::new(&RunConfig::new()).with_binary(fake_aws(dir.path()));

        let err = client
            .describe(&ResourceQuery::new("ec2", "terminate-instances"))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::NotReadOnly { .. }));
        assert!(!dir.path().join("calls.log").exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_command_error() {
        let client = AwsCliQuery::new(&RunConfig::new()).with_binary("/nonexistent/aws");
        let err = client
            .describe(&ResourceQuery::new("ec2", "describe-vpcs"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Command { .. }));
    }
}
