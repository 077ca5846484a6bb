//! `${stage.output}` references between stages.
//!
//! A string that is exactly one reference resolves to the referenced JSON value
//! unchanged, so lists and maps pass between stages intact. A reference inside
//! a longer string is interpolated as text. `$${` stands for a literal `${`.

use super::StageOutputs;
use crate::config::{RunConfig, CONFIG_NAMESPACE};
use crate::errors::{UnresolvedReason, UnresolvedReferenceError};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$\{|\$\{([^}]*)\}").expect("token pattern is valid"));

fn token_pattern() -> &'static Regex {
    &TOKEN
}

/// A parsed `${stage.output}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Stage identifier, numeric run position, or `config`.
    pub stage: String,
    /// Output name (or config key).
    pub output: String,
}

impl Reference {
    /// Parses a reference body such as `network.subnet_id`.
    #[must_use]
    pub fn parse(body: &str) -> Option<Self> {
        let (stage, output) = body.trim().split_once('.')?;
        if stage.is_empty() || output.is_empty() || output.contains('.') {
            return None;
        }
        Some(Self {
            stage: stage.to_string(),
            output: output.to_string(),
        })
    }

    /// Returns true if this reference points into the run configuration.
    #[must_use]
    pub fn is_config(&self) -> bool {
        self.stage == CONFIG_NAMESPACE
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.stage, self.output)
    }
}

/// Returns the bodies of every reference in a string, escapes excluded.
#[must_use]
pub fn reference_bodies(text: &str) -> Vec<String> {
    token_pattern()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Returns true if the string still holds an unresolved reference.
#[must_use]
pub fn has_references(text: &str) -> bool {
    !reference_bodies(text).is_empty()
}

fn collect_bodies(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(reference_bodies(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_bodies(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_bodies(v, out)),
        _ => {}
    }
}

/// Returns the bodies of every reference nested anywhere in a JSON value.
#[must_use]
pub fn references_in(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_bodies(value, &mut out);
    out
}

/// Checks, before anything runs, that every reference in `value` points at
/// the run configuration or at a stage listed strictly before `owner`.
///
/// `earlier` holds the stages that run before `owner`, `later` the owner
/// itself and everything after it.
pub fn check_order(
    owner: &str,
    value: &Value,
    earlier: &[&str],
    later: &[&str],
    config: &RunConfig,
) -> Result<(), UnresolvedReferenceError> {
    for body in references_in(value) {
        let fail = |reason| Err(UnresolvedReferenceError::new(owner, body.clone(), reason));
        let Some(reference) = Reference::parse(&body) else {
            return fail(UnresolvedReason::Malformed);
        };
        if reference.is_config() {
            if config.lookup(&reference.output).is_none() {
                return fail(UnresolvedReason::UnknownConfig);
            }
        } else if earlier.contains(&reference.stage.as_str()) {
            continue;
        } else if later.contains(&reference.stage.as_str()) {
            return fail(UnresolvedReason::ForwardReference);
        } else if let Ok(position) = reference.stage.parse::<usize>() {
            if position >= earlier.len() {
                return fail(UnresolvedReason::ForwardReference);
            }
        } else {
            return fail(UnresolvedReason::UnknownStage);
        }
    }
    Ok(())
}

/// Resolves references against the outputs captured so far.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    outputs: &'a StageOutputs,
    config: &'a RunConfig,
    owner: &'a str,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver for references held by `owner`.
    #[must_use]
    pub fn new(outputs: &'a StageOutputs, config: &'a RunConfig, owner: &'a str) -> Self {
        Self {
            outputs,
            config,
            owner,
        }
    }

    fn error(&self, body: &str, reason: UnresolvedReason) -> UnresolvedReferenceError {
        UnresolvedReferenceError::new(self.owner, body, reason)
    }

    /// Looks up the value a reference body points at.
    pub fn lookup(&self, body: &str) -> Result<Value, UnresolvedReferenceError> {
        let reference =
            Reference::parse(body).ok_or_else(|| self.error(body, UnresolvedReason::Malformed))?;

        if reference.is_config() {
            return self
                .config
                .lookup(&reference.output)
                .ok_or_else(|| self.error(body, UnresolvedReason::UnknownConfig));
        }

        let output = self
            .outputs
            .find(&reference.stage)
            .ok_or_else(|| self.error(body, UnresolvedReason::UnknownStage))?;
        output
            .value(&reference.output)
            .cloned()
            .ok_or_else(|| self.error(body, UnresolvedReason::UnknownOutput))
    }

    /// Interpolates every reference in a string as text.
    pub fn resolve_str(&self, text: &str) -> Result<String, UnresolvedReferenceError> {
        let mut resolved = String::with_capacity(text.len());
        let mut last = 0;
        for caps in token_pattern().captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            resolved.push_str(&text[last..whole.start()]);
            match caps.get(1) {
                Some(body) => match self.lookup(body.as_str())? {
                    Value::String(s) => resolved.push_str(&s),
                    other => resolved.push_str(&other.to_string()),
                },
                None => resolved.push_str("${"),
            }
            last = whole.end();
        }
        resolved.push_str(&text[last..]);
        Ok(resolved)
    }

    fn resolve_string_value(&self, text: &str) -> Result<Value, UnresolvedReferenceError> {
        if let Some(caps) = token_pattern().captures(text) {
            if let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) {
                if whole.start() == 0 && whole.end() == text.len() {
                    return self.lookup(body.as_str());
                }
            }
        }
        self.resolve_str(text).map(Value::String)
    }

    /// Resolves every reference nested in a JSON value.
    pub fn resolve(&self, value: &Value) -> Result<Value, UnresolvedReferenceError> {
        match value {
            Value::String(s) => self.resolve_string_value(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| self.resolve(v).map(|v| (k.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}
