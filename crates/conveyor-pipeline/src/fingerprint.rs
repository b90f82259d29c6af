//! Request fingerprinting for idempotency checks.
//!
//! A fingerprint is the SHA-256 hash of the canonicalized request body:
//! object keys recursively sorted, no whitespace. Two bodies that differ only
//! in key order produce the same fingerprint; any value change produces a
//! different one.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of a request body as a 64-character hex string.
pub fn fingerprint(body: &serde_json::Value) -> String {
    let canonical = sort_json_keys(body).to_string();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sort JSON object keys for a canonical representation.
fn sort_json_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let body = serde_json::json!({"name": "Acme", "tier": "gold"});
        assert_eq!(fingerprint(&body), fingerprint(&body));
        assert_eq!(fingerprint(&body).len(), 64);
    }

    #[test]
    fn test_fingerprint_key_order_insensitive() {
        let a = serde_json::json!({"a": 1, "b": 2, "c": 3});
        let b = serde_json::json!({"c": 3, "a": 1, "b": 2});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_nested_key_order_insensitive() {
        let a = serde_json::json!({"outer": {"z": 1, "a": 2}, "list": [{"y": 1, "x": 2}]});
        let b = serde_json::json!({"list": [{"x": 2, "y": 1}], "outer": {"a": 2, "z": 1}});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_value_sensitive() {
        let a = serde_json::json!({"name": "Acme"});
        let b = serde_json::json!({"name": "Acme Inc"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_array_order_sensitive() {
        let a = serde_json::json!([1, 2, 3]);
        let b = serde_json::json!([3, 2, 1]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
