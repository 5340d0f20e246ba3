//! Whitelisted predicates for `condition` actions.
//!
//! ```json
//! { "all": [
//!     { "field": "trigger.role", "operator": "eq", "value": "student" },
//!     { "not": { "field": "account", "operator": "exists" } }
//! ] }
//! ```

use crate::template::resolve_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    All { all: Vec<Predicate> },
    Any { any: Vec<Predicate> },
    Not { not: Box<Predicate> },
    Compare(Comparison),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    In,
    Exists,
    NotExists,
    StartsWith,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredicateError {
    #[error("Cannot apply {operator:?} to '{field}'")]
    TypeMismatch { field: String, operator: Operator },

    #[error("Field '{0}' not found")]
    MissingField(String),
}

impl Predicate {
    pub fn compare(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Predicate::Compare(Comparison {
            field: field.into(),
            operator,
            value,
        })
    }

    pub fn evaluate(&self, scope: &Value) -> Result<bool, PredicateError> {
        match self {
            Predicate::All { all } => {
                for p in all {
                    if !p.evaluate(scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any { any } => {
                for p in any {
                    if p.evaluate(scope)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not { not } => Ok(!not.evaluate(scope)?),
            Predicate::Compare(c) => c.evaluate(scope),
        }
    }
}

impl Comparison {
    fn evaluate(&self, scope: &Value) -> Result<bool, PredicateError> {
        let actual = resolve_path(scope, &self.field);

        match self.operator {
            Operator::Exists => return Ok(actual.is_some_and(|v| !v.is_null())),
            Operator::NotExists => return Ok(actual.map_or(true, Value::is_null)),
            _ => {}
        }

        let actual = match (actual, self.operator) {
            (Some(actual), _) => actual,
            // An absent field compares equal only to null
            (None, Operator::Eq | Operator::Ne) => &Value::Null,
            (None, _) => return Err(PredicateError::MissingField(self.field.clone())),
        };
        let mismatch = || PredicateError::TypeMismatch {
            field: self.field.clone(),
            operator: self.operator,
        };

        match self.operator {
            Operator::Eq => Ok(loose_eq(actual, &self.value)),
            Operator::Ne => Ok(!loose_eq(actual, &self.value)),
            Operator::Gt => {
                let ord = order(actual, &self.value).ok_or_else(mismatch)?;
                Ok(ord == Ordering::Greater)
            }
            Operator::Gte => {
                let ord = order(actual, &self.value).ok_or_else(mismatch)?;
                Ok(ord != Ordering::Less)
            }
            Operator::Lt => {
                let ord = order(actual, &self.value).ok_or_else(mismatch)?;
                Ok(ord == Ordering::Less)
            }
            Operator::Lte => {
                let ord = order(actual, &self.value).ok_or_else(mismatch)?;
                Ok(ord != Ordering::Greater)
            }
            Operator::Contains => match (actual, &self.value) {
                (Value::String(s), Value::String(needle)) => Ok(s.contains(needle.as_str())),
                (Value::Array(items), needle) => Ok(items.iter().any(|i| loose_eq(i, needle))),
                (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
                _ => Err(mismatch()),
            },
            Operator::In => match &self.value {
                Value::Array(items) => Ok(items.iter().any(|i| loose_eq(actual, i))),
                _ => Err(mismatch()),
            },
            Operator::StartsWith => match (actual, &self.value) {
                (Value::String(s), Value::String(prefix)) => Ok(s.starts_with(prefix.as_str())),
                _ => Err(mismatch()),
            },
            Operator::Exists | Operator::NotExists => Ok(false),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        }
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => {
            s.parse::<bool>().is_ok_and(|parsed| parsed == *x)
        }
        _ => false,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
