//! Conversions between source records, the in-memory detail and the two store
//! representations, plus read-side normalization helpers.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::Detail;
use crate::error::{CacheError, Result};

/// Turns a source or caller record into a detail.
///
/// Objects are taken as-is and strings holding a JSON object are decoded.
/// Anything else cannot be cached field by field.
pub fn record_to_detail(record: Value) -> Result<Detail> {
    match record {
        Value::Object(map) => Ok(map),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            other => Err(CacheError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                kind(&other)
            ))),
        },
        other => Err(CacheError::InvalidRecord(format!(
            "expected an object, got {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// == Integer Coercion ==
/// Integer form of `value`, or `None` when it should be left untouched
/// (null, arrays, objects).
///
/// Strings parse their leading integer part, so `"3.7"` gives 3 and
/// `"abc"` gives 0.
pub fn coerce_int(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Value::from),
        Value::String(s) => Some(Value::from(leading_int(s))),
        Value::Bool(b) => Some(Value::from(i64::from(*b))),
        _ => None,
    }
}

fn leading_int(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let sign_len = usize::from(trimmed.starts_with(['-', '+']));
    let digits_len = trimmed[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    trimmed[..sign_len + digits_len].parse().unwrap_or(0)
}

/// Keeps only the listed fields.
pub fn project(mut detail: Detail, fields: &[String]) -> Detail {
    detail.retain(|key, _| fields.iter().any(|f| f == key));
    detail
}

// == Field-Map Encoding ==
/// Store form of a single field: strings verbatim, null as the empty string,
/// anything else as JSON text.
pub fn encode_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn encode_fields(detail: &Detail) -> Vec<(String, String)> {
    detail
        .iter()
        .map(|(key, value)| (key.clone(), encode_field(value)))
        .collect()
}

/// Hash fields come back as strings, exactly as the store holds them.
pub fn decode_hash(hash: HashMap<String, String>) -> Detail {
    hash.into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect()
}

// == Blob Encoding ==
/// Decodes a blob. Anything that is not a JSON object (including `null`,
/// `[]` and corrupt text) reads as an empty detail so the entry gets rebuilt.
pub fn decode_blob(raw: &str) -> Detail {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Detail::new(),
        Err(err) => {
            debug!(error = %err, "undecodable blob treated as a miss");
            Detail::new()
        }
    }
}
