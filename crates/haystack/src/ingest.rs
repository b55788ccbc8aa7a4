//! JSON-lines ingest: flattening documents into flat records.
//!
//! The store works on single-layer records, so nested structures are
//! flattened with `.`-joined path segments and arrays are flattened by
//! index (duplicate keys are allowed downstream):
//!
//! ```text
//! {"a":"b", "c":{"d":"e"}, "z":[2, 1.4567]}
//!   ->  a=b, c.d=e, z.0=2, z.1=1.4567
//! ```

use crate::error::{HayError, Result};
use crate::mem::{Record, TIMESTAMP_KEY};
use chrono::{SecondsFormat, Utc};
use serde_json::Value as Json;

/// Parses one JSON line into a flat [`Record`].
///
/// A `timestamp` key is promoted to `_timestamp`; a record carrying neither
/// is stamped with the current UTC time in RFC-3339 nanoseconds, so log
/// entries keep a total order even when their producer did not say when
/// they happened.
///
/// # Errors
///
/// [`HayError::Ingest`] for invalid JSON or a non-object line.
pub fn json_line_to_record(line: &str) -> Result<Record> {
    let parsed: Json = serde_json::from_str(line)
        .map_err(|e| HayError::Ingest(format!("invalid JSON line: {e}")))?;

    let obj = match parsed {
        Json::Object(obj) => obj,
        other => {
            return Err(HayError::Ingest(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            )))
        }
    };

    let mut record = Record::new();
    for (key, value) in obj {
        flatten(&key, &value, &mut record);
    }

    if let Some(ts) = record.remove("timestamp") {
        record.insert(TIMESTAMP_KEY.to_string(), ts);
    } else if !record.contains_key(TIMESTAMP_KEY) {
        record.insert(
            TIMESTAMP_KEY.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
    }

    Ok(record)
}

/// Flattens one JSON value under `key` into `out`.
fn flatten(key: &str, value: &Json, out: &mut Record) {
    match value {
        Json::Object(obj) if obj.is_empty() => {
            out.insert(key.to_string(), "map[]".to_string());
        }
        Json::Object(obj) => {
            for (k, v) in obj {
                flatten(&format!("{key}.{k}"), v, out);
            }
        }
        Json::Array(arr) if arr.is_empty() => {
            out.insert(key.to_string(), "[]".to_string());
        }
        Json::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten(&format!("{key}.{i}"), v, out);
            }
        }
        Json::Null => {
            out.insert(key.to_string(), String::new());
        }
        Json::Bool(b) => {
            out.insert(key.to_string(), b.to_string());
        }
        Json::Number(n) => {
            out.insert(key.to_string(), n.to_string());
        }
        Json::String(s) => {
            out.insert(key.to_string(), s.clone());
        }
    }
}

fn json_type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
