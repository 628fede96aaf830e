use serde_json::{Map, Value};

/// Walk a sequence of object keys.
pub fn get_path<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for key in path {
        cur = cur.as_object()?.get(*key)?;
    }
    Some(cur)
}

pub fn get_str<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_path(v, path)?.as_str()
}

pub fn get_f64(v: &Value, path: &[&str]) -> Option<f64> {
    get_path(v, path)?.as_f64()
}

pub fn get_i64(v: &Value, path: &[&str]) -> Option<i64> {
    get_path(v, path)?.as_i64()
}

pub fn get_bool(v: &Value, path: &[&str]) -> Option<bool> {
    get_path(v, path)?.as_bool()
}

pub fn get_array<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Vec<Value>> {
    get_path(v, path)?.as_array()
}

pub fn get_object<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    get_path(v, path)?.as_object()
}

/// Read via a dotted path such as `"guardrails.must_confirm.u_threshold"`.
pub fn get_dotted<'a>(v: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut cur = v;
    for key in dotted.split('.').filter(|p| !p.is_empty()) {
        cur = cur.as_object()?.get(key)?;
    }
    Some(cur)
}

/// Set via a dotted path, creating intermediate objects as needed. A
/// non-object value on the way is replaced by an object.
pub fn set_dotted(root: &mut Value, dotted: &str, value: Value) {
    let parts: Vec<&str> = dotted.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut cur = root;
    for (i, part) in parts.iter().enumerate() {
        let map = cur.as_object_mut().expect("cursor is an object");
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return;
        }
        let slot = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cur = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_path_walks_objects() {
        let v = json!({"a": {"b": {"c": 3}}});
        assert_eq!(get_i64(&v, &["a", "b", "c"]), Some(3));
        assert_eq!(get_path(&v, &["a", "missing"]), None);
    }

    #[test]
    fn dotted_set_creates_intermediates() {
        let mut v = json!({});
        set_dotted(&mut v, "x.y.z", json!(1));
        assert_eq!(v, json!({"x": {"y": {"z": 1}}}));
        assert_eq!(get_dotted(&v, "x.y.z"), Some(&json!(1)));
    }

    #[test]
    fn dotted_set_replaces_scalar_parents() {
        let mut v = json!({"x": 5});
        set_dotted(&mut v, "x.y", json!(true));
        assert_eq!(v, json!({"x": {"y": true}}));
    }
}
