//! Stage specifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Input variables handed to the provisioning collaborator.
pub type InputVars = BTreeMap<String, serde_json::Value>;

/// A named unit of provisioning work.
///
/// Input values may hold `${stage.output}` references to stages that run
/// earlier, and `${config.<name>}` references to the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage identifier.
    pub id: String,
    /// Working directory of the provisioning collaborator.
    pub workdir: PathBuf,
    /// Input parameters, possibly holding references.
    #[serde(default)]
    pub inputs: InputVars,
    /// Keep this stage's resources when the run ends.
    #[serde(default)]
    pub retain: bool,
}

impl StageSpec {
    /// Creates a stage with no inputs.
    #[must_use]
    pub fn new(id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            workdir: workdir.into(),
            inputs: InputVars::new(),
            retain: false,
        }
    }

    /// Adds an input parameter.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Keeps this stage's resources after the run.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Returns the inputs as one JSON object, for reference scanning.
    #[must_use]
    pub fn inputs_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}
