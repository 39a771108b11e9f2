//! Canonical request fingerprints for idempotency checks.
//!
//! The same logical request must always hash identically regardless of field
//! order or of how non-JSON values (dates, bytes, non-finite floats) were
//! supplied. Objects are written with lexicographically sorted keys, then the
//! canonical text is digested with SHA-256 and encoded as unpadded base64url.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("request payload nests deeper than {max} levels")]
    DepthExceeded { max: usize },
}

/// A request payload before canonicalization. Wider than JSON so callers can
/// pass dates, binary and raw floats without pre-encoding them.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestValue {
    Null,
    Bool(bool),
    Number(Number),
    Float(f64),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<RequestValue>),
    Object(BTreeMap<String, RequestValue>),
}

impl From<Value> for RequestValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::String(text),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(key, value)| (key, Self::from(value))).collect())
            }
        }
    }
}

impl From<&Value> for RequestValue {
    fn from(value: &Value) -> Self {
        Self::from(value.clone())
    }
}

pub fn canonical_json(value: &RequestValue) -> Result<String, CanonicalError> {
    let mut output = String::new();
    write_value(value, 0, &mut output)?;
    Ok(output)
}

pub fn request_hash(value: &RequestValue) -> Result<String, CanonicalError> {
    let canonical = canonical_json(value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

pub fn hash_json(value: &Value) -> Result<String, CanonicalError> {
    request_hash(&RequestValue::from(value))
}

fn write_value(value: &RequestValue, depth: usize, output: &mut String) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::DepthExceeded { max: MAX_DEPTH });
    }

    match value {
        RequestValue::Null => output.push_str("null"),
        RequestValue::Bool(flag) => output.push_str(if *flag { "true" } else { "false" }),
        RequestValue::Number(number) => {
            let _ = write!(output, "{number}");
        }
        RequestValue::Float(float) => write_float(*float, output),
        RequestValue::String(text) => write_string(text, output),
        RequestValue::Date(timestamp) => {
            write_string(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true), output)
        }
        RequestValue::Bytes(bytes) => write_string(&STANDARD.encode(bytes), output),
        RequestValue::Array(items) => {
            output.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                write_value(item, depth + 1, output)?;
            }
            output.push(']');
        }
        RequestValue::Object(entries) => {
            // BTreeMap iteration is already in lexicographic key order.
            output.push('{');
            for (index, (key, item)) in entries.iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                write_string(key, output);
                output.push(':');
                write_value(item, depth + 1, output)?;
            }
            output.push('}');
        }
    }

    Ok(())
}

fn write_float(float: f64, output: &mut String) {
    if float.is_nan() {
        write_string("NaN", output);
    } else if float.is_infinite() {
        write_string(if float > 0.0 { "Infinity" } else { "-Infinity" }, output);
    } else if let Some(number) = Number::from_f64(float) {
        let _ = write!(output, "{number}");
    } else {
        output.push_str("null");
    }
}

fn write_string(text: &str, output: &mut String) {
    let _ = write!(output, "{}", Value::from(text));
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use serde_json::json;

    use super::{canonical_json, hash_json, request_hash, CanonicalError, RequestValue, MAX_DEPTH};

    #[test]
    fn hash_is_independent_of_key_order() {
        let left = hash_json(&json!({ "a": 1, "b": 2 })).expect("hash");
        let right = hash_json(&json!({ "b": 2, "a": 1 })).expect("hash");
        assert_eq!(left, right);

        let nested_left = hash_json(&json!({ "outer": { "z": [1, 2], "y": null } })).expect("hash");
        let nested_right =
            hash_json(&json!({ "outer": { "y": null, "z": [1, 2] } })).expect("hash");
        assert_eq!(nested_left, nested_right);
    }

    #[test]
    fn hash_is_base64url_without_padding() {
        let hash = hash_json(&json!({ "order": "SO-1" })).expect("hash");
        assert_eq!(hash.len(), 43);
        assert!(!hash.contains('='));
        assert!(!hash.contains('+'));
        assert!(!hash.contains('/'));
    }

    #[test]
    fn non_finite_floats_map_to_sentinel_strings() {
        let mut raw = BTreeMap::new();
        raw.insert("nan".to_string(), RequestValue::Float(f64::NAN));
        raw.insert("pos".to_string(), RequestValue::Float(f64::INFINITY));
        raw.insert("neg".to_string(), RequestValue::Float(f64::NEG_INFINITY));

        let canonical = canonical_json(&RequestValue::Object(raw.clone())).expect("canonical");
        assert_eq!(canonical, r#"{"nan":"NaN","neg":"-Infinity","pos":"Infinity"}"#);

        let substituted = hash_json(&json!({ "nan": "NaN", "pos": "Infinity", "neg": "-Infinity" }))
            .expect("hash");
        assert_eq!(request_hash(&RequestValue::Object(raw)).expect("hash"), substituted);
    }

    #[test]
    fn dates_and_bytes_are_encoded_as_strings() {
        let timestamp = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc);
        let value = RequestValue::Array(vec![
            RequestValue::Date(timestamp),
            RequestValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
        ]);

        let canonical = canonical_json(&value).expect("canonical");
        assert_eq!(canonical, r#"["2026-03-01T12:00:00.000Z","3q2+7w=="]"#);
    }

    #[test]
    fn excessive_nesting_is_rejected() {
        let mut value = RequestValue::Null;
        for _ in 0..=MAX_DEPTH + 1 {
            value = RequestValue::Array(vec![value]);
        }
        assert_eq!(canonical_json(&value), Err(CanonicalError::DepthExceeded { max: MAX_DEPTH }));
    }
}
