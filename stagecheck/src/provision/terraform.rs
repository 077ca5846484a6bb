//! Provisioning through the `terraform` command line.

use super::tfvars::render_tfvars;
use super::{ApplyOutcome, DestroyOutcome, InputVars, Provisioner};
use crate::core::StageOutput;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;

/// Name of the variable file written into each stage's working directory.
pub const VAR_FILE: &str = "terraform.tfvars";

/// File holding the `required_providers` block.
pub const PROVIDERS_FILE: &str = "terraform.tf";

#[allow(clippy::expect_used)]
static AWS_PROVIDER_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)(aws\s*=\s*\{[^}]*?version\s*=\s*)"[^"]*""#)
        .expect("provider version pattern is valid")
});

/// Removes cached providers and the lock file so `init` starts clean.
pub fn clean_dot_terraform(workdir: &Path) -> Result<()> {
    let cache = workdir.join(".terraform");
    if cache.exists() {
        std::fs::remove_dir_all(&cache)
            .with_context(|| format!("Failed to remove {}", cache.display()))?;
    }
    let lock = workdir.join(".terraform.lock.hcl");
    if lock.exists() {
        std::fs::remove_file(&lock).with_context(|| format!("Failed to remove {}", lock.display()))?;
    }
    Ok(())
}

/// Rewrites the AWS provider version constraint in `terraform.tf`.
///
/// Returns false when the file has no AWS provider block to rewrite.
pub fn update_provider_version(workdir: &Path, constraint: &str) -> Result<bool> {
    let path = workdir.join(PROVIDERS_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if !AWS_PROVIDER_VERSION.is_match(&text) {
        return Ok(false);
    }
    let replacement = format!("${{1}}\"{constraint}\"");
    let updated = AWS_PROVIDER_VERSION.replace(&text, replacement.as_str());
    std::fs::write(&path, updated.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Writes resolved inputs to `terraform.tfvars`.
pub fn write_var_file(workdir: &Path, inputs: &InputVars) -> Result<PathBuf> {
    let path = workdir.join(VAR_FILE);
    std::fs::write(&path, render_tfvars(inputs))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Output of one `terraform` invocation.
struct Invocation {
    success: bool,
    stdout: String,
    log: String,
}

/// Runs `terraform` in each stage's working directory.
#[derive(Debug, Clone)]
pub struct TerraformProvisioner {
    binary: PathBuf,
    provider_version: Option<String>,
    trace: bool,
    clean_init: bool,
}

impl Default for TerraformProvisioner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            provider_version: None,
            trace: false,
            clean_init: true,
        }
    }
}

impl TerraformProvisioner {
    /// Creates a provisioner using `terraform` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Pins the AWS provider to `constraint` before each init.
    #[must_use]
    pub fn with_provider_version(mut self, constraint: Option<String>) -> Self {
        self.provider_version = constraint;
        self
    }

    /// Sets `TF_LOG=JSON` on every invocation.
    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Controls whether `.terraform` is removed before init.
    #[must_use]
    pub fn with_clean_init(mut self, clean_init: bool) -> Self {
        self.clean_init = clean_init;
        self
    }

    async fn invoke(&self, workdir: &Path, args: &[&str]) -> Result<Invocation> {
        tracing::debug!(workdir = %workdir.display(), "terraform {}", args.join(" "));

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .current_dir(workdir)
            .env("TF_IN_AUTOMATION", "1")
            .kill_on_drop(true);
        if self.trace {
            command.env("TF_LOG", "JSON");
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.binary.display(), args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut log = format!("$ terraform {}\n{stdout}", args.join(" "));
        if !stderr.is_empty() {
            log.push_str(&stderr);
        }
        Ok(Invocation {
            success: output.status.success(),
            stdout,
            log,
        })
    }

    fn prepare(&self, workdir: &Path, inputs: &InputVars) -> Result<()> {
        if self.clean_init {
            clean_dot_terraform(workdir)?;
        }
        if let Some(constraint) = &self.provider_version {
            if !update_provider_version(workdir, constraint)? {
                bail!("No AWS provider version constraint in {}", workdir.join(PROVIDERS_FILE).display());
            }
        }
        write_var_file(workdir, inputs)?;
        Ok(())
    }

    async fn try_apply(
        &self,
        workdir: &Path,
        inputs: &InputVars,
        log: &mut String,
    ) -> Result<Option<StageOutput>> {
        self.prepare(workdir, inputs)?;

        let var_file = format!("-var-file={VAR_FILE}");
        let steps: [&[&str]; 2] = [
            &["init", "-input=false", "-no-color"],
            &["apply", "-auto-approve", "-input=false", "-no-color", var_file.as_str()],
        ];
        for args in steps {
            let run = self.invoke(workdir, args).await?;
            log.push_str(&run.log);
            if !run.success {
                return Ok(None);
            }
        }

        let run = self.invoke(workdir, &["output", "-json"]).await?;
        if !run.success {
            log.push_str(&run.log);
            return Ok(None);
        }
        let stage = workdir.display().to_string();
        let output = StageOutput::from_terraform_json(stage, &run.stdout)
            .context("Failed to parse terraform output -json")?;
        Ok(Some(output))
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, workdir: &Path, inputs: &InputVars) -> ApplyOutcome {
        let mut log = String::new();
        match self.try_apply(workdir, inputs, &mut log).await {
            Ok(Some(output)) => ApplyOutcome::succeeded(output.into_values(), log),
            Ok(None) => ApplyOutcome::failed(log),
            Err(err) => {
                let _ = write!(log, "{err:#}");
                ApplyOutcome::failed(log)
            }
        }
    }

    async fn destroy(&self, workdir: &Path) -> DestroyOutcome {
        let var_file = format!("-var-file={VAR_FILE}");
        let mut args = vec!["destroy", "-auto-approve", "-input=false", "-no-color"];
        if workdir.join(VAR_FILE).exists() {
            args.push(var_file.as_str());
        }
        match self.invoke(workdir, &args).await {
            Ok(run) if run.success => DestroyOutcome::succeeded(run.log),
            Ok(run) => DestroyOutcome::failed(run.log),
            Err(err) => DestroyOutcome::failed(format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const PROVIDERS: &str = r#"terraform {
  required_providers {
    aws = {
      source  = "hashicorp/aws"
      version = "~> 5.0"
    }
    random = {
      source  = "hashicorp/random"
      version = "3.6.0"
    }
  }
}
"#;

    #[test]
    fn test_update_provider_version_only_touches_aws() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROVIDERS_FILE), PROVIDERS).unwrap();

        assert!(update_provider_version(dir.path(), "5.31.0").unwrap());

        let text = std::fs::read_to_string(dir.path().join(PROVIDERS_FILE)).unwrap();
        assert!(text.contains(r#"version = "5.31.0""#));
        assert!(text.contains(r#"version = "3.6.0""#));
        assert!(!text.contains("~> 5.0"));
    }

    #[test]
    fn test_update_provider_version_without_aws_block() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROVIDERS_FILE), "terraform {}\n").unwrap();

        assert!(!update_provider_version(dir.path(), "5.31.0").unwrap());
        assert!(update_provider_version(&dir.path().join("missing"), "5.31.0").is_err());
    }

    #[test]
    fn test_clean_dot_terraform() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".terraform/providers")).unwrap();
        std::fs::write(dir.path().join(".terraform.lock.hcl"), "").unwrap();

        clean_dot_terraform(dir.path()).unwrap();

        assert!(!dir.path().join(".terraform").exists());
        assert!(!dir.path().join(".terraform.lock.hcl").exists());
        clean_dot_terraform(dir.path()).unwrap();
    }

    #[test]
    fn test_write_var_file() {
        let dir = TempDir::new().unwrap();
        let inputs: InputVars = [("subnet_id".to_string(), json!("subnet-abc"))].into();

        let path = write_var_file(dir.path(), &inputs).unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "subnet_id = \"subnet-abc\"\n");
    }

    #[cfg(unix)]
    fn fake_terraform(dir: &Path, apply_exit: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r#"#!/bin/sh
echo "$@" >> calls.log
case "$1" in
  init) echo "Terraform has been successfully initialized!" ;;
  apply) echo "Apply output"; echo "apply error" >&2; exit {apply_exit} ;;
  output) echo '{{"subnet_id":{{"sensitive":false,"type":"string","value":"subnet-abc"}}}}' ;;
  destroy) echo "Destroy complete!" ;;
esac
"#
        );
        let path = dir.join("terraform");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_and_destroy_with_fake_binary() {
        let bin = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let provisioner = TerraformProvisioner::new().with_binary(fake_terraform(bin.path(), 0));
        let inputs: InputVars = [("region".to_string(), json!("us-east-2"))].into();

        let applied = provisioner.apply(workdir.path(), &inputs).await;
        assert!(applied.success, "{}", applied.raw_log);
        assert_eq!(applied.outputs["subnet_id"].value, json!("subnet-abc"));
        assert!(workdir.path().join(VAR_FILE).exists());

        let destroyed = provisioner.destroy(workdir.path()).await;
        assert!(destroyed.success);

        let calls = std::fs::read_to_string(workdir.path().join("calls.log")).unwrap();
        let commands: Vec<&str> = calls.lines().map(|l| l.split(' ').next().unwrap()).collect();
        assert_eq!(commands, vec!["init", "apply", "output", "destroy"]);
        assert!(calls.contains("-var-file=terraform.tfvars"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_apply_keeps_raw_log() {
        let bin = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let provisioner = TerraformProvisioner::new().with_binary(fake_terraform(bin.path(), 1));

        let applied = provisioner.apply(workdir.path(), &InputVars::new()).await;

        assert!(!applied.success);
        assert!(applied.outputs.is_empty());
        assert!(applied.raw_log.contains("apply error"));
        let calls = std::fs::read_to_string(workdir.path().join("calls.log")).unwrap();
        assert!(!calls.contains("output"));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_failure() {
        let workdir = TempDir::new().unwrap();
        let provisioner = TerraformProvisioner::new().with_binary("/nonexistent/terraform");

        let destroyed = provisioner.destroy(workdir.path()).await;

        assert!(!destroyed.success);
        assert!(destroyed.raw_log.contains("Failed to run"));
    }
}
