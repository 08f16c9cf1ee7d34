//! Canonical Byte Encoding
//!
//! Every value that is hashed or signed goes through this module first.
//! The canonical form is UTF-8 JSON with keys sorted lexicographically at
//! every object level, no insignificant whitespace, and integers emitted
//! without a fractional part. Floats are rejected outright: two peers that
//! disagree on float formatting would disagree on every digest.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while canonicalizing a value.
#[derive(Debug, Error)]
pub enum CanonicalError {
    /// A non-integer number was encountered. Timestamps and counters are
    /// integer milliseconds; there is no canonical float representation.
    #[error("non-integer number {0} is not canonicalizable")]
    FloatRejected(String),

    /// The value could not be serialized at all.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Convert any serializable value into its canonical JSON tree.
///
/// `serde_json::Map` keeps keys in sorted order, so the resulting tree
/// serializes with lexicographic key order at every nesting level.
pub fn canonical_value<T: Serialize>(value: &T) -> Result<Value, CanonicalError> {
    let tree = serde_json::to_value(value)?;
    reject_floats(&tree)?;
    Ok(tree)
}

/// Canonical UTF-8 bytes of a value. This is the exact input to hashing
/// and signing everywhere in the engine.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    Ok(canonical_string(value)?.into_bytes())
}

/// Canonical JSON text of a value.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let tree = canonical_value(value)?;
    Ok(serde_json::to_string(&tree)?)
}

/// Walk a JSON tree and fail on the first non-integer number.
fn reject_floats(value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Number(n) => {
            if n.is_f64() && n.as_i64().is_none() && n.as_u64().is_none() {
                return Err(CanonicalError::FloatRejected(n.to_string()));
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_floats(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                reject_floats(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_at_every_level() {
        let value = json!({
            "zulu": 1,
            "alpha": {"y": 2, "x": 1},
            "mike": [{"b": 1, "a": 2}]
        });

        let text = canonical_string(&value).unwrap();
        assert_eq!(
            text,
            r#"{"alpha":{"x":1,"y":2},"mike":[{"a":2,"b":1}],"zulu":1}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "text"});
        let text = canonical_string(&value).unwrap();
        assert!(!text.contains(' '));
    }

    #[test]
    fn test_integers_stay_integers() {
        let value = json!({"ts": 1700000000123u64, "n": -5});
        let text = canonical_string(&value).unwrap();
        assert_eq!(text, r#"{"n":-5,"ts":1700000000123}"#);
    }

    #[test]
    fn test_floats_rejected() {
        let value = json!({"bad": 1.5});
        assert!(matches!(
            canonical_value(&value),
            Err(CanonicalError::FloatRejected(_))
        ));
    }

    #[test]
    fn test_nested_float_rejected() {
        let value = json!({"outer": {"inner": [1, 2.25]}});
        assert!(canonical_bytes(&value).is_err());
    }

    #[test]
    fn test_determinism() {
        let value = json!({"b": {"d": 4, "c": 3}, "a": [true, null, "s"]});
        let first = canonical_bytes(&value).unwrap();
        let second = canonical_bytes(&value).unwrap();
        assert_eq!(first, second);
    }

    // Fixed vector shared with any other implementation of this encoding.
    #[test]
    fn test_reference_vector() {
        let value = json!({
            "move_type": "ACTION",
            "data": {"query": {"y": 3, "x": 3}, "type": "query_cell"},
            "nonce": 2,
            "timestamp": 1700000000000u64,
            "participant_id": "04ab"
        });
        let text = canonical_string(&value).unwrap();
        assert_eq!(
            text,
            r#"{"data":{"query":{"x":3,"y":3},"type":"query_cell"},"move_type":"ACTION","nonce":2,"participant_id":"04ab","timestamp":1700000000000}"#
        );
    }
}
