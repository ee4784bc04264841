//! Query modifiers shared by the server and the local mirror.
//!
//! A [`Filter`] is evaluated by the same code on both sides, so a query
//! answered by the remote and the same query answered offline return records
//! in the same order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::Record;

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("Invalid condition '{0}': expected <field><op><value>, e.g. done=false or amount>=10")]
    InvalidCondition(String),

    #[error("Empty field name in condition '{0}'")]
    EmptyField(String),
}

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive substring for strings, membership for arrays.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Parses `field<op>value`. Operators: `=`, `!=`, `>`, `>=`, `<`, `<=`, `~`.
    ///
    /// The value is read as JSON when it parses as JSON, otherwise as a string,
    /// so `done=false` compares against a boolean and `title=milk` against text.
    pub fn parse(s: &str) -> Result<Self, FilterError> {
        // Two-character operators first so `>=` is not read as `>`.
        const OPS: [(&str, Op); 7] = [
            ("!=", Op::Ne),
            (">=", Op::Gte),
            ("<=", Op::Lte),
            ("=", Op::Eq),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("~", Op::Contains),
        ];

        let (pos, token, op) = OPS
            .iter()
            .filter_map(|(token, op)| s.find(token).map(|pos| (pos, *token, *op)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| FilterError::InvalidCondition(s.to_string()))?;

        let field = s[..pos].trim();
        if field.is_empty() {
            return Err(FilterError::EmptyField(s.to_string()));
        }
        let raw = s[pos + token.len()..].trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        Ok(Self::new(field, op, value))
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.field(&self.field).unwrap_or(Value::Null);
        match self.op {
            Op::Eq => compare(&actual, &self.value) == Some(Ordering::Equal),
            Op::Ne => compare(&actual, &self.value) != Some(Ordering::Equal),
            Op::Gt => compare(&actual, &self.value) == Some(Ordering::Greater),
            Op::Gte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Op::Lt => compare(&actual, &self.value) == Some(Ordering::Less),
            Op::Lte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Op::Contains => contains(&actual, &self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Conditions, ordering and limit for a scoped read.
///
/// Records are ordered by `order_by` when set, then by `updated_at` and `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_condition(Condition::new(field, Op::Eq, value))
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Keeps matching records, sorts them and applies the limit.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut records: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        sort_records(&mut records, self.order_by.as_ref());
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

/// Applies an optional filter; without one only the default ordering is applied.
pub fn apply_filter(filter: Option<&Filter>, records: Vec<Record>) -> Vec<Record> {
    match filter {
        Some(filter) => filter.apply(records),
        None => {
            let mut records = records;
            sort_records(&mut records, None);
            records
        }
    }
}

fn sort_records(records: &mut [Record], order_by: Option<&OrderBy>) {
    records.sort_by(|a, b| {
        let primary = match order_by {
            Some(order) => {
                let av = a.field(&order.field).unwrap_or(Value::Null);
                let bv = b.field(&order.field).unwrap_or(Value::Null);
                let ord = total_order(&av, &bv);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            None => Ordering::Equal,
        };
        primary
            .then_with(|| a.updated_at.cmp(&b.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Compares two values of the same kind; `None` for incomparable kinds.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            (a == b).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orders any two values: by kind first, then by value.
fn total_order(a: &Value, b: &Value) -> Ordering {
    kind_rank(a)
        .cmp(&kind_rank(b))
        .then_with(|| compare(a, b).unwrap_or(Ordering::Equal))
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.to_lowercase().contains(&n.to_lowercase()),
        (Value::Array(items), n) => items
            .iter()
            .any(|item| compare(item, n) == Some(Ordering::Equal)),
        _ => false,
    }
}
