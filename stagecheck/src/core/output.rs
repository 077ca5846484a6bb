//! Stage output values as reported by the provisioning collaborator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder shown instead of sensitive values.
pub const REDACTED: &str = "<sensitive>";

/// One named output of a stage.
///
/// The shape matches `terraform output -json`, so a whole output document can
/// be deserialized straight into a map of these.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    /// The output data.
    pub value: serde_json::Value,
    /// Whether the value must be kept out of logs and reports.
    #[serde(default)]
    pub sensitive: bool,
    /// Type description, when the collaborator reports one.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<serde_json::Value>,
}

impl OutputValue {
    /// Creates a non-sensitive output value.
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            sensitive: false,
            value_type: None,
        }
    }

    /// Creates a sensitive output value.
    #[must_use]
    pub fn sensitive(value: serde_json::Value) -> Self {
        Self {
            value,
            sensitive: true,
            value_type: None,
        }
    }

    /// Returns the value, or the redaction placeholder if it is sensitive.
    #[must_use]
    pub fn display_value(&self) -> serde_json::Value {
        if self.sensitive {
            serde_json::Value::String(REDACTED.to_string())
        } else {
            self.value.clone()
        }
    }
}

impl std::fmt::Debug for OutputValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputValue")
            .field("value", &self.display_value())
            .field("sensitive", &self.sensitive)
            .finish()
    }
}

/// The outputs captured from one successful stage invocation.
///
/// `StageOutput` is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    stage: String,
    values: BTreeMap<String, OutputValue>,
}

impl StageOutput {
    /// Creates a stage output from already-described values.
    #[must_use]
    pub fn new(stage: impl Into<String>, values: BTreeMap<String, OutputValue>) -> Self {
        Self {
            stage: stage.into(),
            values,
        }
    }

    /// Creates a stage output with no values.
    #[must_use]
    pub fn empty(stage: impl Into<String>) -> Self {
        Self::new(stage, BTreeMap::new())
    }

    /// Creates a stage output from plain, non-sensitive values.
    #[must_use]
    pub fn from_values<K, I>(stage: impl Into<String>, values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.into(), OutputValue::new(v)))
            .collect();
        Self::new(stage, values)
    }

    /// Parses the document printed by `terraform output -json`.
    pub fn from_terraform_json(stage: impl Into<String>, json: &str) -> Result<Self, serde_json::Error> {
        let trimmed = json.trim();
        let values = if trimmed.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(trimmed)?
        };
        Ok(Self::new(stage, values))
    }

    /// Returns the identifier of the stage that produced these outputs.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the described output with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.values.get(name)
    }

    /// Returns the raw value of the output with the given name.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name).map(|v| &v.value)
    }

    /// Returns the output names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Returns the number of outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the stage produced no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the output, returning the described values.
    #[must_use]
    pub fn into_values(self) -> BTreeMap<String, OutputValue> {
        self.values
    }

    /// Returns a JSON object of the outputs with sensitive values redacted.
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.display_value()))
            .collect();
        serde_json::Value::Object(map)
    }
}
