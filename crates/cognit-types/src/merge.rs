use serde_json::Value;

/// Recursively merge `src` into `dst`. Maps merge key-by-key; scalars and
/// lists replace. This is the entire inter-stage communication protocol.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(slot) if slot.is_object() && v.is_object() => deep_merge(slot, v),
                    Some(slot) => *slot = v,
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}
