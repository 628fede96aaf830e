use serde_json::{Value, json};

/// A fresh session state for `thread_id`, shaped the way the session store
/// creates one.
pub fn session_state(thread_id: &str) -> Value {
    json!({
        "session": {"thread_id": thread_id},
        "endpoints": {"transport": {"channel": thread_id}},
    })
}

/// A committed user message as the event stream the perception collector
/// expects.
pub fn commit_events(text: &str, commit_time: &str) -> Vec<Value> {
    vec![
        json!({"type": "typing_start"}),
        json!({"type": "message_commit", "text": text, "t": commit_time}),
    ]
}

/// A runtime config snapshot with the given must-confirm threshold, shaped
/// like the activator's output. Seeding it directly lets tests exercise the
/// gatekeeper/scheduler path without running the adaptation chain.
pub fn runtime_config(u_threshold: f64) -> Value {
    json!({
        "guardrails": {
            "must_confirm": {"u_threshold": u_threshold},
            "block_execute_when": {"slo_below": 0.0},
            "latency_soft_limit_ms": 1500,
            "index_queue_soft_max": 1000,
        },
        "executor": {"timeout_ms": 30000, "parallelism": {"max_inflight": 4}},
        "features": {},
    })
}

/// An executor request for a named skill, with the deterministic-id fields a
/// dispatcher would have produced.
pub fn skill_request(req_id: &str, skill_id: &str, params: Value) -> Value {
    json!({
        "req_id": req_id,
        "skill_id": skill_id,
        "params": params,
        "timeout_ms": 30000,
        "idempotency_key": req_id,
    })
}
