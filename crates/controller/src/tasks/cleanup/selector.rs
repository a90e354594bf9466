//! Label selector evaluation
//!
//! Converts a Kubernetes `LabelSelector` into a validated [`Selector`] that
//! can be evaluated against an object's labels and rendered into the
//! query-string form the API server accepts for server-side filtering.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

const MAX_NAME_LENGTH: usize = 63;
const MAX_PREFIX_LENGTH: usize = 253;

lazy_static! {
    static ref NAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("valid label name regex");
    static ref PREFIX_PATTERN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("valid DNS subdomain regex");
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid value {value:?} for label {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("unsupported operator {operator:?} for label {key:?}")]
    UnsupportedOperator { key: String, operator: String },

    #[error("operator {operator} for label {key:?} {reason}")]
    InvalidValues {
        key: String,
        operator: Operator,
        reason: &'static str,
    },

    #[error("rejected by the API server: {0}")]
    Rejected(String),
}

/// Set-based selector operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Operator {
    fn parse(key: &str, raw: &str) -> Result<Self, SelectorError> {
        match raw {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            other => Err(SelectorError::UnsupportedOperator {
                key: key.to_string(),
                operator: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::In => "In",
            Operator::NotIn => "NotIn",
            Operator::Exists => "Exists",
            Operator::DoesNotExist => "DoesNotExist",
        };
        f.write_str(s)
    }
}

/// A single `matchExpressions` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }

    fn to_query(&self) -> String {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => format!("{} in ({})", self.key, joined()),
            Operator::NotIn => format!("{} notin ({})", self.key, joined()),
            Operator::Exists => self.key.clone(),
            Operator::DoesNotExist => format!("!{}", self.key),
        }
    }
}

/// Validated label selector
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    /// Selects every object
    #[default]
    MatchAll,
    /// Conjunction of exact label matches and set-based requirements
    Match {
        labels: BTreeMap<String, String>,
        expressions: Vec<Requirement>,
    },
}

impl Selector {
    /// Builds a selector from an optional `LabelSelector`.
    ///
    /// An absent or empty selector matches everything. Malformed keys, values
    /// or operators are rejected rather than silently matching nothing.
    pub fn from_label_selector(selector: Option<&LabelSelector>) -> Result<Self, SelectorError> {
        let Some(selector) = selector else {
            return Ok(Selector::MatchAll);
        };

        let mut labels = BTreeMap::new();
        for (key, value) in selector.match_labels.iter().flatten() {
            validate_key(key)?;
            validate_value(key, value)?;
            labels.insert(key.clone(), value.clone());
        }

        let mut expressions = Vec::new();
        for expr in selector.match_expressions.iter().flatten() {
            expressions.push(parse_requirement(expr)?);
        }

        if labels.is_empty() && expressions.is_empty() {
            return Ok(Selector::MatchAll);
        }

        Ok(Selector::Match {
            labels,
            expressions,
        })
    }

    /// Returns whether an object with the given labels is selected.
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match self {
            Selector::MatchAll => true,
            Selector::Match {
                labels: required,
                expressions,
            } => {
                let empty = BTreeMap::new();
                let labels = labels.unwrap_or(&empty);
                required.iter().all(|(k, v)| labels.get(k) == Some(v))
                    && expressions.iter().all(|r| r.matches(labels))
            }
        }
    }

    /// Renders the selector in API-server query form (`app=web,tier notin (db)`).
    ///
    /// Terms are sorted by key so the output is stable. `MatchAll` renders as
    /// `None` so callers can omit the parameter entirely.
    #[must_use]
    pub fn to_query(&self) -> Option<String> {
        match self {
            Selector::MatchAll => None,
            Selector::Match {
                labels,
                expressions,
            } => {
                let mut terms: Vec<(String, String)> = labels
                    .iter()
                    .map(|(k, v)| (k.clone(), format!("{k}={v}")))
                    .collect();
                terms.extend(expressions.iter().map(|r| (r.key.clone(), r.to_query())));
                terms.sort();
                Some(
                    terms
                        .into_iter()
                        .map(|(_, term)| term)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
        }
    }
}

fn parse_requirement(expr: &LabelSelectorRequirement) -> Result<Requirement, SelectorError> {
    validate_key(&expr.key)?;
    let operator = Operator::parse(&expr.key, &expr.operator)?;
    let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();

    match operator {
        Operator::In | Operator::NotIn if values.is_empty() => {
            return Err(SelectorError::InvalidValues {
                key: expr.key.clone(),
                operator,
                reason: "requires at least one value",
            });
        }
        Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
            return Err(SelectorError::InvalidValues {
                key: expr.key.clone(),
                operator,
                reason: "must not specify values",
            });
        }
        _ => {}
    }

    for value in &values {
        validate_value(&expr.key, value)?;
    }

    Ok(Requirement {
        key: expr.key.clone(),
        operator,
        values,
    })
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason: &str| SelectorError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(invalid("prefix must be 1-253 characters"));
        }
        if !PREFIX_PATTERN.is_match(prefix) {
            return Err(invalid("prefix must be a DNS subdomain"));
        }
    }

    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(invalid("name must be 1-63 characters"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(invalid(
            "name must consist of alphanumerics, '-', '_' or '.' and start and end with an alphanumeric",
        ));
    }

    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LENGTH || !NAME_PATTERN.is_match(value) {
        return Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
