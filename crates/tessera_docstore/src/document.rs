//! Conversion between document fields and engine values.

use serde_json::Number;
use tessera_core::value::Value;

pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field of a document. Falls back to a case insensitive match.
pub fn field<'a>(document: &'a Document, name: &str) -> Option<&'a serde_json::Value> {
    document.get(name).or_else(|| {
        document
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Missing fields and nulls are empty, arrays and objects are invalid.
pub fn json_to_value(json: Option<&serde_json::Value>) -> Value {
    match json {
        None | Some(serde_json::Value::Null) => Value::Empty,
        Some(serde_json::Value::Bool(b)) => Value::Bool(*b),
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Double).unwrap_or(Value::Invalid),
        },
        Some(serde_json::Value::String(s)) => Value::String(s.clone()),
        Some(serde_json::Value::Array(_)) | Some(serde_json::Value::Object(_)) => Value::Invalid,
    }
}

/// JSON literal for `value`, None when it has no faithful representation.
pub fn value_to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Int(i) => Some(serde_json::Value::Number((*i).into())),
        Value::Double(d) => Number::from_f64(*d).map(serde_json::Value::Number),
        Value::String(s) => Some(serde_json::Value::String(s.clone())),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Empty => Some(serde_json::Value::Null),
        Value::Date(_) | Value::Invalid => None,
    }
}

/// Representation of a computed value stored in a document.
///
/// Dates are stored as seconds. Values without a JSON form are stored as an
/// empty array, which reads back as invalid.
pub fn store_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Date(secs) => Number::from_f64(*secs)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        other => value_to_json(other).unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
    }
}
