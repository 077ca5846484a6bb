//! `stagecheck` command line.
//!
//! Provisions the stages of a run plan, probes and verifies them, tears them
//! down, and prints a JSON summary. Exits 0 only if everything passed.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use stagecheck::config::RunConfig;
use stagecheck::core::StageOutputs;
use stagecheck::events::LoggingEventSink;
use stagecheck::observability::{init_tracing, LogFormat};
use stagecheck::plan::{ProbePlan, RunPlan};
use stagecheck::probe::Prober;
use stagecheck::provision::{Orchestrator, TerraformProvisioner};
use stagecheck::verify::{AwsCliQuery, Verifier};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision, probe, verify and tear down a run plan
    Run(RunArgs),
    /// Check a run plan's references without provisioning anything
    Validate {
        /// Run plan file
        #[arg(short, long)]
        plan: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Poll a single endpoint until it is healthy or the timeout expires
    Probe {
        /// Target URL (http://, https:// or tcp://host:port)
        url: String,

        /// Overall timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Timeout of each attempt in seconds
        #[arg(long, default_value = "5")]
        per_attempt_timeout: u64,

        /// Expected HTTP status
        #[arg(long, default_value = "200")]
        status: u16,

        /// Expected exact response body
        #[arg(long)]
        body: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// AWS region
    #[arg(long, env = "STAGECHECK_REGION", default_value = "us-east-2")]
    region: String,

    /// Role to assume for provisioning and queries
    #[arg(long, env = "STAGECHECK_ROLE_ARN")]
    role_arn: Option<String>,

    /// Keep resources after the run
    #[arg(long, env = "STAGECHECK_KEEP_AFTER")]
    keep_after: bool,

    /// DNS zone name
    #[arg(long, env = "STAGECHECK_TEST_ZONE")]
    test_zone: Option<String>,

    /// Hosted zone identifier
    #[arg(long, env = "STAGECHECK_ZONE_ID")]
    zone_id: Option<String>,

    /// AWS provider version constraint written into each stage
    #[arg(long, env = "STAGECHECK_PROVIDER_VERSION")]
    provider_version: Option<String>,

    /// Upper bound on provisioning plus verification, in seconds
    #[arg(long)]
    run_timeout: Option<u64>,
}

impl ConfigArgs {
    fn into_config(self) -> RunConfig {
        let mut config = RunConfig::new()
            .with_region(self.region)
            .with_keep_after(self.keep_after);
        if let Some(role_arn) = self.role_arn {
            config = config.with_role_arn(role_arn);
        }
        if let Some(zone) = self.test_zone {
            config = config.with_test_zone(zone);
        }
        if let Some(zone_id) = self.zone_id {
            config = config.with_zone_id(zone_id);
        }
        if let Some(constraint) = self.provider_version {
            config = config.with_provider_version(constraint);
        }
        if let Some(secs) = self.run_timeout {
            config = config.with_run_timeout(Duration::from_secs(secs));
        }
        config
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Run plan file
    #[arg(short, long)]
    plan: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    /// Terraform binary
    #[arg(long, default_value = "terraform")]
    terraform: PathBuf,

    /// Set TF_LOG=JSON on every terraform invocation
    #[arg(long)]
    trace_terraform: bool,

    /// Keep .terraform between runs instead of initializing from scratch
    #[arg(long)]
    keep_init: bool,

    /// Evaluate a failing assertion up to this many times
    #[arg(long, default_value = "1")]
    settle_attempts: u32,

    /// Seconds between settle attempts
    #[arg(long, default_value = "10")]
    settle_delay: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format).context("Failed to install tracing subscriber")?;

    let passed = match cli.command {
        Command::Run(args) => run(args).await?,
        Command::Validate { plan, config } => validate(&plan, &config.into_config())?,
        Command::Probe {
            url,
            timeout,
            per_attempt_timeout,
            status,
            body,
        } => {
            let plan = ProbePlan {
                status,
                body,
                timeout_secs: timeout,
                per_attempt_timeout_secs: per_attempt_timeout,
                ..ProbePlan::new(url)
            };
            probe(&plan).await?
        }
    };

    Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn validate(path: &std::path::Path, config: &RunConfig) -> Result<bool> {
    let plan = RunPlan::load(path)?;
    let orchestrator = Orchestrator::new(Arc::new(TerraformProvisioner::new()), config.clone());

    let result = orchestrator
        .validate(&plan.stages)
        .map_err(|e| e.to_json())
        .and_then(|()| plan.check_references(config).map_err(|e| json!({ "message": e.to_string() })));
    match result {
        Ok(()) => {
            print_json(&json!({ "valid": true, "stages": plan.stages.len() }))?;
            Ok(true)
        }
        Err(report) => {
            print_json(&json!({ "valid": false, "error": report }))?;
            Ok(false)
        }
    }
}

async fn probe(plan: &ProbePlan) -> Result<bool> {
    let (target, settings) = plan
        .resolve(&StageOutputs::new(), &RunConfig::new())
        .context("Invalid probe")?;
    let prober = Prober::new()
        .context("Failed to build HTTP client")?
        .with_event_sink(Arc::new(LoggingEventSink::default()));

    let result = prober.probe(&target, &settings).await;
    print_json(&json!({ "target": target.url(), "result": result }))?;
    Ok(result.is_healthy())
}

async fn probe_and_verify(
    plan: &RunPlan,
    config: &RunConfig,
    prober: &Prober,
    verifier: &Verifier,
    outputs: StageOutputs,
) -> Value {
    let mut probes = Vec::with_capacity(plan.probes.len());
    let mut targets = Vec::with_capacity(plan.probes.len());
    for probe in &plan.probes {
        match probe.resolve(&outputs, config) {
            Ok(target) => targets.push(target),
            Err(err) => probes.push(json!({ "target": probe.url, "error": err.to_string() })),
        }
    }
    let results = prober.probe_all(&targets).await;
    let mut healthy = probes.is_empty();
    for ((target, _), result) in targets.iter().zip(results) {
        healthy &= result.is_healthy();
        probes.push(json!({ "target": target.url(), "result": result }));
    }

    let report = verifier.verify(&outputs, &plan.checks).await;
    json!({
        "passed": healthy && report.is_success(),
        "outputs": outputs.redacted(),
        "probes": probes,
        "verification": report,
    })
}

async fn run(args: RunArgs) -> Result<bool> {
    let plan = RunPlan::load(&args.plan)?;
    let config = args.config.into_config();
    let started_at = Utc::now();

    let sink = Arc::new(LoggingEventSink::default());
    let provisioner = TerraformProvisioner::new()
        .with_binary(args.terraform)
        .with_provider_version(config.provider_version.clone())
        .with_trace(args.trace_terraform)
        .with_clean_init(!args.keep_init);
    let orchestrator =
        Orchestrator::new(Arc::new(provisioner), config.clone()).with_event_sink(sink.clone());
    let prober = Prober::new()
        .context("Failed to build HTTP client")?
        .with_event_sink(sink.clone());
    let verifier = Verifier::new(Arc::new(AwsCliQuery::new(&config)), config.clone())
        .with_event_sink(sink)
        .with_settle(args.settle_attempts, Duration::from_secs(args.settle_delay));

    plan.check_references(&config)
        .context("Run plan failed its checks")?;

    info!(plan = %args.plan.display(), stages = plan.stages.len(), "Starting run");
    let result = orchestrator
        .run_scoped(&plan.stages, |outputs| {
            probe_and_verify(&plan, &config, &prober, &verifier, outputs)
        })
        .await;

    let (passed, mut summary) = match result {
        Ok(outcome) => {
            let clean = outcome.teardown.is_clean();
            let passed = clean && outcome.value["passed"] == Value::Bool(true);
            let mut summary = outcome.value;
            summary["run_id"] = json!(outcome.run_id.to_string());
            summary["teardown"] = outcome.teardown.to_json();
            summary["passed"] = json!(passed);
            (passed, summary)
        }
        Err(err) => {
            error!("Run failed: {err}");
            (false, json!({ "passed": false, "error": err.to_json() }))
        }
    };
    summary["started_at"] = json!(started_at.to_rfc3339());
    summary["finished_at"] = json!(Utc::now().to_rfc3339());

    print_json(&summary)?;
    Ok(passed)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
