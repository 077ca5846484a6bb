//! Verification assertions.

use super::path::select;
use super::query::ResourceQuery;
use crate::core::Resolver;
use crate::errors::UnresolvedReferenceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Where an assertion reads its actual value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionSource {
    /// The response of a describe query.
    Describe(ResourceQuery),
    /// The records returned by a list query.
    List(ResourceQuery),
    /// A captured stage output, such as `${network.subnet_id}`.
    Output {
        /// The reference to resolve.
        reference: String,
    },
}

impl AssertionSource {
    /// Reads a captured stage output.
    #[must_use]
    pub fn output(reference: impl Into<String>) -> Self {
        Self::Output {
            reference: reference.into(),
        }
    }
}

/// The comparison an assertion makes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Check {
    /// The value at `path` equals `expected`.
    Equals {
        /// Dotted path into the actual value.
        #[serde(default)]
        path: String,
        /// Expected value.
        expected: Value,
    },
    /// The list (or map) at `path` has `expected` entries.
    Length {
        /// Dotted path into the actual value.
        #[serde(default)]
        path: String,
        /// Expected number of entries.
        expected: usize,
    },
    /// The list at `path` holds `expected`, or the string at `path` contains it.
    Contains {
        /// Dotted path into the actual value.
        #[serde(default)]
        path: String,
        /// Expected element or substring.
        expected: Value,
    },
}

/// The result of one comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// Whether the check held.
    pub passed: bool,
    /// What was expected.
    pub expected: Value,
    /// What was found at the path (`null` if nothing was).
    pub actual: Value,
    /// Human-readable description naming both values.
    pub diagnostic: String,
}

impl Check {
    /// Checks that the value at `path` equals `expected`.
    #[must_use]
    pub fn equals(path: impl Into<String>, expected: Value) -> Self {
        Self::Equals {
            path: path.into(),
            expected,
        }
    }

    /// Checks the number of entries at `path`.
    #[must_use]
    pub fn length(path: impl Into<String>, expected: usize) -> Self {
        Self::Length {
            path: path.into(),
            expected,
        }
    }

    /// Checks that the value at `path` contains `expected`.
    #[must_use]
    pub fn contains(path: impl Into<String>, expected: Value) -> Self {
        Self::Contains {
            path: path.into(),
            expected,
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Equals { path, .. } | Self::Length { path, .. } | Self::Contains { path, .. } => path,
        }
    }

    /// Compares `root` against this check.
    #[must_use]
    pub fn compare(&self, root: &Value) -> Comparison {
        let path = self.path();
        let at = if path.is_empty() {
            "value".to_string()
        } else {
            format!("'{path}'")
        };
        let Some(actual) = select(root, path) else {
            return Comparison {
                passed: false,
                expected: self.expected(),
                actual: Value::Null,
                diagnostic: format!("nothing found at {at}; expected {}", self.expected()),
            };
        };

        match self {
            Self::Equals { expected, .. } => {
                let passed = &actual == expected;
                let diagnostic = if passed {
                    format!("{at} equals {expected}")
                } else {
                    format!("expected {at} to equal {expected}, got {actual}")
                };
                Comparison {
                    passed,
                    expected: expected.clone(),
                    actual,
                    diagnostic,
                }
            }
            Self::Length { expected, .. } => {
                let length = match &actual {
                    Value::Array(items) => Some(items.len()),
                    Value::Object(map) => Some(map.len()),
                    _ => None,
                };
                let (passed, diagnostic) = match length {
                    Some(n) if n == *expected => (true, format!("{at} has {n} entries")),
                    Some(n) => (false, format!("expected {at} to have {expected} entries, got {n}")),
                    None => (false, format!("expected {at} to be a list, got {actual}")),
                };
                Comparison {
                    passed,
                    expected: json!(expected),
                    actual: length.map_or(actual, |n| json!(n)),
                    diagnostic,
                }
            }
            Self::Contains { expected, .. } => {
                let passed = match (&actual, expected) {
                    (Value::Array(items), _) => items.contains(expected),
                    (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                    _ => false,
                };
                let diagnostic = if passed {
                    format!("{at} contains {expected}")
                } else {
                    format!("expected {at} to contain {expected}, got {actual}")
                };
                Comparison {
                    passed,
                    expected: expected.clone(),
                    actual,
                    diagnostic,
                }
            }
        }
    }

    /// Returns a copy whose expected value has every reference resolved.
    pub fn resolve(&self, resolver: &Resolver<'_>) -> Result<Self, UnresolvedReferenceError> {
        Ok(match self {
            Self::Equals { path, expected } => Self::Equals {
                path: path.clone(),
                expected: resolver.resolve(expected)?,
            },
            Self::Contains { path, expected } => Self::Contains {
                path: path.clone(),
                expected: resolver.resolve(expected)?,
            },
            Self::Length { .. } => self.clone(),
        })
    }

    pub(crate) fn expected(&self) -> Value {
        match self {
            Self::Equals { expected, .. } | Self::Contains { expected, .. } => expected.clone(),
            Self::Length { expected, .. } => json!(expected),
        }
    }
}

/// A named check against the live system or the captured outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionSpec {
    /// Name reported in the verification report.
    pub name: String,
    /// Where the actual value comes from.
    pub source: AssertionSource,
    /// How it is compared.
    pub check: Check,
}

impl AssertionSpec {
    /// Creates an assertion.
    #[must_use]
    pub fn new(name: impl Into<String>, source: AssertionSource, check: Check) -> Self {
        Self {
            name: name.into(),
            source,
            check,
        }
    }

    /// Compares a describe response.
    #[must_use]
    pub fn describe(name: impl Into<String>, query: ResourceQuery, check: Check) -> Self {
        Self::new(name, AssertionSource::Describe(query), check)
    }

    /// Compares the records of a list query.
    #[must_use]
    pub fn list(name: impl Into<String>, query: ResourceQuery, check: Check) -> Self {
        Self::new(name, AssertionSource::List(query), check)
    }

    /// Compares a captured stage output.
    #[must_use]
    pub fn output(name: impl Into<String>, reference: impl Into<String>, check: Check) -> Self {
        Self::new(name, AssertionSource::output(reference), check)
    }
}
