use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_error::{EngineError, Result};

/// A single cell value.
///
/// Equality is not reflexive: `Invalid` never equals anything, itself
/// included. `Empty` only equals `Empty`. Other variants compare numerically
/// when both sides can be read as numbers and as strings otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Value {
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
    /// Seconds since the unix epoch, UTC.
    Date(f64),
    #[default]
    Empty,
    Invalid,
}

impl Value {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn double_value(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Date(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::String(s) => parse_number(s),
            Value::Empty | Value::Invalid => None,
        }
    }

    /// Integer representation. Doubles are truncated, doubles outside of the
    /// i64 range have no integer value.
    pub fn int_value(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => parse_number(s).and_then(double_to_int),
            },
            Value::Double(v) | Value::Date(v) => double_to_int(*v),
            Value::Empty | Value::Invalid => None,
        }
    }

    pub fn string_value(&self) -> Option<String> {
        match self {
            Value::Int(v) => Some(v.to_string()),
            Value::Double(v) => Some(format_double(*v)),
            Value::String(s) => Some(s.clone()),
            Value::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
            Value::Date(v) => Some(format_date(*v)),
            Value::Empty | Value::Invalid => None,
        }
    }

    pub fn bool_value(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::Double(v) => Some(*v != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => parse_number(s).map(|v| v != 0.0),
            },
            Value::Date(_) | Value::Empty | Value::Invalid => None,
        }
    }

    /// Bool conversion failing with an error, used for setting values.
    pub fn try_as_bool(&self) -> Result<bool> {
        self.bool_value()
            .ok_or_else(|| EngineError::new(format!("Cannot read {self} as a boolean")))
    }

    pub fn try_as_usize(&self) -> Result<usize> {
        self.int_value()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| EngineError::new(format!("Cannot read {self} as a non-negative integer")))
    }

    pub fn try_as_string(&self) -> Result<String> {
        self.string_value()
            .ok_or_else(|| EngineError::new(format!("Cannot read {self:?} as a string")))
    }

    /// Numeric comparison when both sides are numbers, string comparison when
    /// both sides have a string representation, None otherwise.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if !self.is_valid() || !other.is_valid() || self.is_empty() || other.is_empty() {
            return None;
        }
        if let (Value::Int(a), Value::Int(b)) = (self, other) {
            return Some(a.cmp(b));
        }
        match (self.double_value(), other.double_value()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => match (self.string_value(), other.string_value()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }

    fn numeric_op(
        &self,
        other: &Value,
        int_op: fn(i64, i64) -> Option<i64>,
        double_op: fn(f64, f64) -> f64,
    ) -> Value {
        if let (Some(a), Some(b)) = (self.exact_int(), other.exact_int()) {
            if let Some(v) = int_op(a, b) {
                return Value::Int(v);
            }
        }
        match (self.double_value(), other.double_value()) {
            (Some(a), Some(b)) => Value::from_double(double_op(a, b)),
            _ => Value::Invalid,
        }
    }

    /// Integer value when this value is an integer without any loss.
    fn exact_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    fn from_double(v: f64) -> Value {
        if v.is_finite() {
            Value::Double(v)
        } else {
            Value::Invalid
        }
    }

    pub fn add(&self, other: &Value) -> Value {
        self.numeric_op(other, i64::checked_add, |a, b| a + b)
    }

    pub fn subtract(&self, other: &Value) -> Value {
        self.numeric_op(other, i64::checked_sub, |a, b| a - b)
    }

    pub fn multiply(&self, other: &Value) -> Value {
        self.numeric_op(other, i64::checked_mul, |a, b| a * b)
    }

    pub fn divide(&self, other: &Value) -> Value {
        match other.double_value() {
            Some(d) if d == 0.0 => return Value::Invalid,
            None => return Value::Invalid,
            _ => (),
        }
        self.numeric_op(
            other,
            |a, b| match a.checked_rem(b) {
                Some(0) => a.checked_div(b),
                _ => None,
            },
            |a, b| a / b,
        )
    }

    pub fn modulus(&self, other: &Value) -> Value {
        match other.double_value() {
            Some(d) if d == 0.0 => return Value::Invalid,
            None => return Value::Invalid,
            _ => (),
        }
        self.numeric_op(other, i64::checked_rem, |a, b| a % b)
    }

    pub fn concat(&self, other: &Value) -> Value {
        match (self.string_value(), other.string_value()) {
            (Some(a), Some(b)) => Value::String(a + &b),
            _ => Value::Invalid,
        }
    }

    pub fn negate(&self) -> Value {
        match self {
            Value::Int(v) => v.checked_neg().map(Value::Int).unwrap_or(Value::Invalid),
            other => match other.double_value() {
                Some(v) => Value::from_double(-v),
                None => Value::Invalid,
            },
        }
    }

    /// Comparison producing a `Bool` value, or `Invalid` when incomparable.
    pub fn compare_with(&self, other: &Value, accept: fn(Ordering) -> bool) -> Value {
        match self.compare(other) {
            Some(ord) => Value::Bool(accept(ord)),
            None => Value::Invalid,
        }
    }

    /// Equality as a value. `Invalid` on either side yields `Invalid`.
    pub fn equals(&self, other: &Value) -> Value {
        if !self.is_valid() || !other.is_valid() {
            return Value::Invalid;
        }
        Value::Bool(self == other)
    }

    pub fn not_equals(&self, other: &Value) -> Value {
        match self.equals(other) {
            Value::Bool(b) => Value::Bool(!b),
            other => other,
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

fn double_to_int(v: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which itself is out of range.
    if v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v.trunc() as i64)
    } else {
        None
    }
}

fn format_double(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn format_date(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as i64;
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => dt.to_rfc3339(),
        None => format_double(secs),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Invalid, _) | (_, Value::Invalid) => false,
            (Value::Empty, Value::Empty) => true,
            (Value::Empty, _) | (_, Value::Empty) => false,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::String(a), Value::String(b)) => {
                a == b || matches!((parse_number(a), parse_number(b)), (Some(x), Some(y)) if x == y)
            }
            (a, b) => match (a.double_value(), b.double_value()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.string_value(), b.string_value()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Invalid => write!(f, "#INVALID"),
            other => match other.string_value() {
                Some(s) => write!(f, "{s}"),
                None => Ok(()),
            },
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map(Value::Int).unwrap_or(Value::Invalid)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Empty,
        }
    }
}
