use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a value as canonical JSON: object keys sorted recursively, compact
/// separators. Equal values always hash equal regardless of insertion order.
pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).expect("scalar serializes")),
    }
}

/// SHA-256 hex digest of the canonical JSON rendering. Every deterministic id
/// in the system is built from this.
pub fn content_hash(v: &Value) -> String {
    hex_digest(canonical_json(v).as_bytes())
}

/// SHA-256 hex digest of raw text.
pub fn text_hash(s: &str) -> String {
    hex_digest(s.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Stable bucket assignment from the leading 32 bits of a text hash. Used for
/// percentage rollouts and deterministic jitter.
pub fn hash_bucket(s: &str, modulo: u32) -> u32 {
    if modulo == 0 {
        return 0;
    }
    let digest = Sha256::digest(s.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    n % modulo
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn hash_is_order_insensitive() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_distinguishes_values() {
        assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": 2})));
    }

    #[test]
    fn buckets_are_stable_and_bounded() {
        let b1 = hash_bucket("t-1|salt", 100);
        let b2 = hash_bucket("t-1|salt", 100);
        assert_eq!(b1, b2);
        assert!(b1 < 100);
        assert_eq!(hash_bucket("anything", 0), 0);
    }
}
