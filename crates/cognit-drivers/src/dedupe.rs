use std::collections::HashMap;
use std::collections::VecDeque;

use serde_json::Value;

/// Bounded idempotency-key cache. Drivers coalesce duplicate deliveries by
/// returning the remembered reply instead of re-applying the effect.
pub(crate) struct ReplyCache {
    capacity: usize,
    order: VecDeque<String>,
    replies: HashMap<String, Value>,
}

impl ReplyCache {
    pub fn new(capacity: usize) -> Self {
        ReplyCache {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            replies: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.replies.get(key).cloned()
    }

    pub fn put(&mut self, key: &str, reply: Value) {
        if key.is_empty() {
            return;
        }
        if !self.replies.contains_key(key) {
            self.order.push_back(key.to_string());
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.replies.remove(&evicted);
                }
            }
        }
        self.replies.insert(key.to_string(), reply);
    }
}

pub(crate) fn idempotency_key(frame: &Value) -> String {
    frame
        .get("idempotency_key")
        .and_then(|k| k.as_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_remembers_and_evicts_oldest() {
        let mut cache = ReplyCache::new(2);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("c", json!(3));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn empty_keys_are_not_cached() {
        let mut cache = ReplyCache::new(4);
        cache.put("", json!(1));
        assert_eq!(cache.get(""), None);
    }
}
