use chrono::{DateTime, SecondsFormat};
use serde_json::Value;

use cognit_types::{get_i64, get_str};

/// Product segment of every persisted-key namespace.
pub const PRODUCT: &str = "cognit";

/// Aliases the addressing stage recognizes when no override is configured.
pub const DEFAULT_AGENT_ALIASES: [&str; 2] = ["cognit", "cog"];

/// The tick clock stamped by the I/O loop. Stages never read the wall clock.
pub fn now_ms(state: &Value) -> i64 {
    get_i64(state, &["clock", "now_ms"]).unwrap_or(0)
}

/// RFC 3339 rendering of a state-clock instant.
pub fn iso_from_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

pub fn parse_iso_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

pub fn thread_id(state: &Value) -> String {
    get_str(state, &["session", "thread_id"])
        .filter(|t| !t.is_empty())
        .unwrap_or("default")
        .to_string()
}

pub fn store_namespace(state: &Value) -> String {
    format!("store/{}/{}", PRODUCT, thread_id(state))
}

pub fn cache_namespace(state: &Value) -> String {
    format!("cache/{}/{}", PRODUCT, thread_id(state))
}

pub fn config_namespace(state: &Value) -> String {
    format!("config/{}/{}", PRODUCT, thread_id(state))
}

/// Case-insensitive comparison key for token and alias matching.
pub fn fold(s: &str) -> String {
    s.to_lowercase()
}

/// Aliases the agent answers to; `session.agent_aliases` overrides the
/// built-in set.
pub fn agent_aliases(state: &Value) -> Vec<String> {
    if let Some(items) = state
        .get("session")
        .and_then(|s| s.get("agent_aliases"))
        .and_then(|a| a.as_array())
    {
        let out: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str())
            .map(fold)
            .collect();
        if !out.is_empty() {
            return out;
        }
    }
    DEFAULT_AGENT_ALIASES.iter().map(|a| fold(a)).collect()
}
