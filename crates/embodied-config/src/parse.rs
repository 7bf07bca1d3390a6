//! Parsers for user-entered configuration strings
//!
//! Form fields arrive as free text or as already-structured YAML/JSON values.
//! These helpers accept both.

use serde_json::Value;
use std::collections::HashMap;

/// Error from [`parse_mapping`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Invalid mapping line: {0}")]
    InvalidLine(String),
    #[error("Empty key in mapping")]
    EmptyKey,
    #[error("Expected mapping JSON")]
    NotAnObject,
}

/// Render a scalar the way a user would have typed it
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a header or routing map.
///
/// Accepts an object, a JSON object string, or `key: value` lines. Blank
/// lines are skipped; a line without `:` or with an empty key is an error.
/// Values are split at the first colon only.
pub fn parse_mapping(value: &Value) -> Result<HashMap<String, String>, MappingError> {
    if let Value::Object(map) = value {
        return Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), display_value(v)))
            .collect());
    }

    let text = display_value(value);
    let text = text.trim();
    if text.is_empty() {
        return Ok(HashMap::new());
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), display_value(v)))
            .collect()),
        Ok(_) => Err(MappingError::NotAnObject),
        Err(_) => parse_mapping_lines(text),
    }
}

fn parse_mapping_lines(text: &str) -> Result<HashMap<String, String>, MappingError> {
    let mut pairs = HashMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (key, val) = line
            .split_once(':')
            .ok_or_else(|| MappingError::InvalidLine(line.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(MappingError::EmptyKey);
        }
        pairs.insert(key.to_string(), val.trim().to_string());
    }
    Ok(pairs)
}

/// Parse a comma or newline separated list, dropping empty items
pub fn parse_string_collection(value: &Value) -> Vec<String> {
    let items: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| display_value(item).trim().to_string())
            .collect(),
        other => display_value(other)
            .split([',', '\n'])
            .map(|item| item.trim().to_string())
            .collect(),
    };

    items.into_iter().filter(|item| !item.is_empty()).collect()
}

/// Integer conversion matching form input: integers, whole or fractional
/// numbers (truncated) and numeric strings.
pub(crate) fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Convert a value to a strictly positive integer
pub fn coerce_positive_int(value: &Value) -> Option<u32> {
    coerce_int(value)
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

/// Truthiness of a loosely typed flag
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
