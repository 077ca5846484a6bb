//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::OutputValue;
use crate::errors::QueryError;
use crate::probe::{ProbeAttempt, ProbeTarget};
use crate::provision::{ApplyOutcome, DestroyOutcome, InputVars, Provisioner};
use crate::verify::{LiveQuery, ResourceQuery};

#[derive(Debug, Clone)]
enum Script {
    Sequence(Arc<Vec<Result<(), String>>>),
    ByHost(Arc<HashMap<String, bool>>),
}

/// A probe attempt with scripted outcomes.
///
/// Clones share the call counter.
#[derive(Debug, Clone)]
pub struct ScriptedAttempt {
    script: Script,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl ScriptedAttempt {
    /// Returns the outcomes in order, repeating the last one.
    #[must_use]
    pub fn new(outcomes: Vec<Result<(), String>>) -> Self {
        Self {
            script: Script::Sequence(Arc::new(outcomes)),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Always succeeds.
    #[must_use]
    pub fn always_ok() -> Self {
        Self::new(vec![Ok(())])
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn always_err(error: &str) -> Self {
        Self::new(vec![Err(error.to_string())])
    }

    /// Succeeds for hosts mapped to true, fails for every other host.
    #[must_use]
    pub fn by_host<'a>(hosts: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let hosts = hosts.into_iter().map(|(h, up)| (h.to_string(), up)).collect();
        Self {
            script: Script::ByHost(Arc::new(hosts)),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Sleeps before every attempt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns how many attempts were made.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeAttempt for ScriptedAttempt {
    async fn attempt(&self, target: &ProbeTarget, _per_attempt_timeout: Duration) -> Result<(), String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Sequence(outcomes) => outcomes
                .get(call)
                .or_else(|| outcomes.last())
                .cloned()
                .unwrap_or(Ok(())),
            Script::ByHost(hosts) => {
                if hosts.get(target.host()).copied().unwrap_or(false) {
                    Ok(())
                } else {
                    Err("connection refused".to_string())
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    applied: Vec<String>,
    inputs: HashMap<String, InputVars>,
    destroyed: Vec<String>,
}

/// A provisioner that records every call and never touches real infrastructure.
///
/// Stages are identified by the final component of their working directory.
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    outputs: HashMap<String, Vec<(String, serde_json::Value)>>,
    apply_failures: HashMap<String, String>,
    apply_delays: HashMap<String, Duration>,
    destroy_failures: HashMap<String, String>,
    destroy_panics: HashSet<String>,
    state: Mutex<ProvisionerState>,
}

fn stage_of(workdir: &Path) -> String {
    workdir
        .file_name()
        .map_or_else(|| workdir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

impl RecordingProvisioner {
    /// Creates a provisioner whose stages apply with no outputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `outputs` when `stage` is applied.
    #[must_use]
    pub fn with_outputs<'a>(
        mut self,
        stage: &str,
        outputs: impl IntoIterator<Item = (&'a str, serde_json::Value)>,
    ) -> Self {
        let outputs = outputs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self.outputs.insert(stage.to_string(), outputs);
        self
    }

    /// Fails the apply of `stage` with `raw_log`.
    #[must_use]
    pub fn fail_apply(mut self, stage: &str, raw_log: &str) -> Self {
        self.apply_failures.insert(stage.to_string(), raw_log.to_string());
        self
    }

    /// Sleeps before the apply of `stage` completes.
    #[must_use]
    pub fn with_apply_delay(mut self, stage: &str, delay: Duration) -> Self {
        self.apply_delays.insert(stage.to_string(), delay);
        self
    }

    /// Fails the destroy of `stage` with `raw_log`.
    #[must_use]
    pub fn fail_destroy(mut self, stage: &str, raw_log: &str) -> Self {
        self.destroy_failures.insert(stage.to_string(), raw_log.to_string());
        self
    }

    /// Panics while destroying `stage`.
    #[must_use]
    pub fn panic_on_destroy(mut self, stage: &str) -> Self {
        self.destroy_panics.insert(stage.to_string());
        self
    }

    /// Returns applied stages in call order, including failed applies.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    /// Returns the inputs `stage` was applied with.
    #[must_use]
    pub fn applied_inputs(&self, stage: &str) -> Option<InputVars> {
        self.state.lock().inputs.get(stage).cloned()
    }

    /// Returns destroyed stages in call order, including failed destroys.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn apply(&self, workdir: &Path, inputs: &InputVars) -> ApplyOutcome {
        let stage = stage_of(workdir);
        {
            let mut state = self.state.lock();
            state.applied.push(stage.clone());
            state.inputs.insert(stage.clone(), inputs.clone());
        }
        if let Some(delay) = self.apply_delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(raw_log) = self.apply_failures.get(&stage) {
            return ApplyOutcome::failed(raw_log.clone());
        }
        let outputs = self
            .outputs
            .get(&stage)
            .map(|values| {
                values
                    .iter()
                    .map(|(k, v)| (k.clone(), OutputValue::new(v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        ApplyOutcome::succeeded(outputs, format!("Apply complete: {stage}"))
    }

    async fn destroy(&self, workdir: &Path) -> DestroyOutcome {
        let stage = stage_of(workdir);
        self.state.lock().destroyed.push(stage.clone());
        if self.destroy_panics.contains(&stage) {
            panic!("destroy of {stage} panicked");
        }
        match self.destroy_failures.get(&stage) {
            Some(raw_log) => DestroyOutcome::failed(raw_log.clone()),
            None => DestroyOutcome::succeeded(format!("Destroy complete: {stage}")),
        }
    }
}

/// A live-query collaborator answering from canned responses.
///
/// Responses are keyed by operation. Each call takes the next response and
/// the last one repeats.
#[derive(Debug, Default)]
pub struct StaticLiveQuery {
    describe: Mutex<HashMap<String, VecDeque<Result<serde_json::Value, String>>>>,
    list: Mutex<HashMap<String, VecDeque<Result<Vec<serde_json::Value>, String>>>>,
    calls: Mutex<Vec<ResourceQuery>>,
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl StaticLiveQuery {
    /// Creates a collaborator with no responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `describe` calls for `operation` with `response`.
    #[must_use]
    pub fn with_describe(self, operation: &str, response: serde_json::Value) -> Self {
        self.describe
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(Ok(response));
        self
    }

    /// Answers `list` calls for `operation` with `items`.
    #[must_use]
    pub fn with_list(self, operation: &str, items: Vec<serde_json::Value>) -> Self {
        self.list
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(Ok(items));
        self
    }

    /// Fails `describe` calls for `operation`.
    #[must_use]
    pub fn failing(self, operation: &str, message: &str) -> Self {
        self.describe
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
        self
    }

    /// Returns every query made, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<ResourceQuery> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LiveQuery for StaticLiveQuery {
    async fn describe(&self, query: &ResourceQuery) -> Result<serde_json::Value, QueryError> {
        self.calls.lock().push(query.clone());
        let response = self
            .describe
            .lock()
            .get_mut(&query.operation)
            .and_then(next);
        match response {
            Some(Ok(value)) => query.select_from(value),
            Some(Err(message)) => Err(QueryError::Command {
                query: query.to_string(),
                message,
            }),
            None => Err(QueryError::Command {
                query: query.to_string(),
                message: "no canned response".to_string(),
            }),
        }
    }

    async fn list(&self, query: &ResourceQuery) -> Result<Vec<serde_json::Value>, QueryError> {
        self.calls.lock().push(query.clone());
        let response = self.list.lock().get_mut(&query.operation).and_then(next);
        match response {
            Some(Ok(items)) => Ok(items),
            Some(Err(message)) => Err(QueryError::Command {
                query: query.to_string(),
                message,
            }),
            None => Err(QueryError::Command {
                query: query.to_string(),
                message: "no canned response".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_attempt_repeats_last_outcome() {
        let attempt = ScriptedAttempt::new(vec![Err("down".to_string()), Ok(())]);
        let target = ProbeTarget::tcp("svc", 80);
        let per_attempt = Duration::from_secs(1);

        assert!(attempt.attempt(&target, per_attempt).await.is_err());
        assert!(attempt.attempt(&target, per_attempt).await.is_ok());
        assert!(attempt.attempt(&target, per_attempt).await.is_ok());
        assert_eq!(attempt.clone().calls(), 3);
    }

    #[tokio::test]
    async fn test_recording_provisioner_identifies_stage_by_workdir() {
        let provisioner = RecordingProvisioner::new()
            .with_outputs("network", [("vpc_id", serde_json::json!("vpc-1"))]);

        let applied = provisioner
            .apply(Path::new("test_data/network"), &InputVars::new())
            .await;
        provisioner.destroy(Path::new("test_data/network")).await;

        assert_eq!(applied.outputs["vpc_id"].value, serde_json::json!("vpc-1"));
        assert_eq!(provisioner.applied(), vec!["network"]);
        assert_eq!(provisioner.destroyed(), vec!["network"]);
    }
}
