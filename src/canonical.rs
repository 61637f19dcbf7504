//! Canonical JSON
//!
//! Deterministic serialization: object keys sorted, no whitespace, array
//! order kept.
//!
//! The hashing form used by the integrity ledger omits object members whose
//! value is `null`, so an absent optional field and an explicit `null`
//! produce the same bytes. Empty strings, arrays and objects are values and
//! are kept. The encryption plaintext uses the sorted form with nulls kept,
//! since it must decrypt back to the exact record.

use crate::error::{AuditError, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Maximum nesting depth accepted before canonicalization fails
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nulls {
    Omit,
    Keep,
}

/// Serialize any value into canonical JSON
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    canonical_json(&value)
}

/// Canonical JSON for an already-built `serde_json::Value`
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(value, 0, Nulls::Omit, &mut out)?;
    Ok(out)
}

/// Sorted-key JSON that keeps `null` members
///
/// Lossless: deserializing the output yields the original value.
pub fn to_sorted_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, 0, Nulls::Keep, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, depth: usize, nulls: Nulls, out: &mut String) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(AuditError::Canonicalization(format!(
            "nesting exceeds {} levels",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, depth + 1, nulls, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map
                .iter()
                .filter(|(_, v)| nulls == Nulls::Keep || !v.is_null())
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(item, depth + 1, nulls, out)?;
            }
            out.push('}');
        }
    }

    Ok(())
}

/// Hex-encoded SHA-256 of the given byte slices, fed in order
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
