//! Tagged scalar values and their total ordering.

use std::cmp::Ordering;
use std::sync::Arc;

/// Wire tag for integer values.
pub const VALTYPE_INT: u8 = 1;
/// Wire tag for float values.
pub const VALTYPE_FLOAT: u8 = 2;
/// Wire tag for string values.
pub const VALTYPE_STRING: u8 = 3;

/// A scalar cell value: int, float, or shared string.
///
/// String values are held behind an [`Arc`] so several stalks can share one
/// allocation after deduplication.
#[derive(Debug, Clone)]
pub enum Value {
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE-754 float.
    Float(f64),
    /// Shared immutable string.
    Str(Arc<str>),
}

impl Value {
    /// Parses a value string the way ingest does: try int, then float, then
    /// keep it as a string.
    ///
    /// The literal forms `"[]"` and `"map[]"` (flattened empty containers)
    /// normalise to the empty string.
    pub fn parse(v: &str) -> Self {
        if let Ok(i) = v.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = v.parse::<f64>() {
            return Value::Float(f);
        }
        if v == "[]" || v == "map[]" {
            return Value::Str(Arc::from(""));
        }
        Value::Str(Arc::from(v))
    }

    /// Wire tag of this value; also its rank in the sort order.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Int(_) => VALTYPE_INT,
            Value::Float(_) => VALTYPE_FLOAT,
            Value::Str(_) => VALTYPE_STRING,
        }
    }

    /// Total ordering: tag first (int < float < string), then value.
    ///
    /// Strings compare case-insensitively: a byte-equal fast path, then
    /// lower-cased ordering. Floats use `total_cmp` so even NaN inputs
    /// (which `parse` accepts) order deterministically.
    pub fn compare(&self, other: &Value) -> Ordering {
        match self.type_tag().cmp(&other.type_tag()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => {
                if a == b {
                    return Ordering::Equal;
                }
                a.to_lowercase().cmp(&b.to_lowercase())
            }
            _ => unreachable!("tags already compared"),
        }
    }

    /// String projection of the value, as used for search re-verification
    /// and record output.
    pub fn projection(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.to_string(),
        }
    }

    /// Shared string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes this value contributes to a Haybale's memsize estimate
    /// beyond the fixed per-stalk cost.
    pub fn extra_memsize(&self) -> u32 {
        match self {
            Value::Str(s) => 2 + s.len() as u32,
            _ => 0,
        }
    }
}
