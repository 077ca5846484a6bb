//! Append-only store of stage outputs.

use super::StageOutput;
use crate::errors::OutputConflictError;
use std::collections::HashMap;

/// Outputs of the stages that have completed so far, in run order.
///
/// The orchestrator is the only writer and records a stage's outputs once,
/// after its invocation completed; later stages and the verifier only read.
#[derive(Debug, Clone, Default)]
pub struct StageOutputs {
    outputs: Vec<StageOutput>,
    positions: HashMap<String, usize>,
}

impl StageOutputs {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage's outputs.
    ///
    /// # Errors
    ///
    /// Returns `OutputConflictError` if outputs for that stage were already recorded.
    pub fn record(&mut self, output: StageOutput) -> Result<(), OutputConflictError> {
        if self.positions.contains_key(output.stage()) {
            return Err(OutputConflictError::new(output.stage()));
        }
        self.positions.insert(output.stage().to_string(), self.outputs.len());
        self.outputs.push(output);
        Ok(())
    }

    /// Gets the outputs of a stage by identifier.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&StageOutput> {
        self.positions.get(stage).map(|&i| &self.outputs[i])
    }

    /// Gets the outputs of the stage that ran at `position` (zero-based).
    #[must_use]
    pub fn at(&self, position: usize) -> Option<&StageOutput> {
        self.outputs.get(position)
    }

    /// Returns the run position of a stage.
    #[must_use]
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.positions.get(stage).copied()
    }

    /// Finds a stage by identifier, falling back to a numeric run position.
    #[must_use]
    pub fn find(&self, stage: &str) -> Option<&StageOutput> {
        self.get(stage)
            .or_else(|| stage.parse::<usize>().ok().and_then(|i| self.at(i)))
    }

    /// Returns true if the stage has recorded outputs.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.positions.contains_key(stage)
    }

    /// Iterates over outputs in run order.
    pub fn iter(&self) -> impl Iterator<Item = &StageOutput> {
        self.outputs.iter()
    }

    /// Returns the number of stages recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Consumes the store, returning outputs in run order.
    #[must_use]
    pub fn into_vec(self) -> Vec<StageOutput> {
        self.outputs
    }

    /// Returns a JSON object of every stage's redacted outputs.
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .outputs
            .iter()
            .map(|o| (o.stage().to_string(), o.redacted()))
            .collect();
        serde_json::Value::Object(map)
    }
}
