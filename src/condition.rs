use std::cmp::Ordering;
use std::str::FromStr;

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConditionError, VariableInput};


/// Comparison operator of a [`Condition`], identified on the wire by its
/// `SCREAMING_SNAKE_CASE` name (`EQUAL`, `GREATER_THAN`, ...).
#[derive(Display, FromStr, Clone, Copy, Debug, PartialEq, Eq)]
#[display(style = "SNAKE_CASE")]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    GreaterThan,
    LessEqual,
    LessThan,
    Truthy,
}

/// A conditional expression over variable values.
///
/// `operator` is kept as the raw wire string; it is parsed at evaluation
/// time so that an unrecognized name surfaces as
/// [`ConditionError::UnsupportedOperator`] rather than being silently
/// defaulted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Condition {
    pub variable: VariableInput,
    pub operator: String,
    pub other: VariableInput,
}

/// Evaluates `operator` over two resolved values.
///
/// Equality is strict (`5` and `"5"` are not equal). Ordering operators
/// compare numbers numerically and strings lexicographically; mixed or
/// unordered operand types are a configuration error. `TRUTHY` coerces
/// `value` to a boolean and ignores `other`.
pub fn evaluate(operator: &str, value: &Value, other: &Value) -> Result<bool, ConditionError> {
    let op = Operator::from_str(operator)
        .map_err(|_| ConditionError::UnsupportedOperator(operator.to_string()))?;
    Ok(match op {
        Operator::Equal => value == other,
        Operator::NotEqual => value != other,
        Operator::GreaterEqual => compare(value, other)? != Ordering::Less,
        Operator::GreaterThan => compare(value, other)? == Ordering::Greater,
        Operator::LessEqual => compare(value, other)? != Ordering::Greater,
        Operator::LessThan => compare(value, other)? == Ordering::Less,
        Operator::Truthy => truthy(value),
    })
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ConditionError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64(), r.as_f64());
            match (l, r) {
                (Some(l), Some(r)) => l.partial_cmp(&r).ok_or(incomparable(left, right)),
                _ => Err(incomparable(left, right)),
            }
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(incomparable(left, right)),
    }
}

fn incomparable(left: &Value, right: &Value) -> ConditionError {
    ConditionError::Incomparable {
        left: type_name(left),
        right: type_name(right),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Boolean coercion matching the semantics of the wire protocol's source
/// environment: `null` and empty strings are false, numbers are true unless
/// zero or NaN, arrays and objects are always true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
