use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, update};

/// Pick the committed message out of the raw event stream. The text is left
/// untouched; normalization happens downstream.
pub fn collect(state: &Value) -> Result<StageOutcome> {
    let Some(events) = state.get("events").and_then(|e| e.as_array()) else {
        return Ok(StageOutcome::skip_with(
            "no_events",
            update(json!({"perception": {"events": [], "meta": {"truncated": false}}})),
        ));
    };

    let valid: Vec<&Value> = events
        .iter()
        .filter(|e| e.get("type").and_then(|t| t.as_str()).is_some())
        .collect();
    if valid.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_events",
            update(json!({"perception": {"events": [], "meta": {"truncated": false}}})),
        ));
    }

    let trace: Vec<&str> = valid
        .iter()
        .filter_map(|e| e.get("type").and_then(|t| t.as_str()))
        .filter(|t| *t == "typing_start" || *t == "typing_stop")
        .collect();

    let Some(last) = valid
        .iter()
        .rev()
        .find(|e| e["type"].as_str() == Some("message_commit"))
    else {
        return Ok(StageOutcome::skip_with(
            "no_commit",
            update(json!({"perception": {"events": trace, "meta": {"truncated": false}}})),
        ));
    };

    let text = match last.get("text") {
        Some(Value::String(s)) => s.clone(),
        _ => return Ok(StageOutcome::fail("invalid_text_type")),
    };
    let commit_time = last.get("t").and_then(|t| t.as_str());

    let mut out_events: Vec<Value> = trace.iter().map(|t| json!(t)).collect();
    out_events.push(json!("commit"));

    let len = text.chars().count();
    Ok(StageOutcome::ok_with(
        update(json!({
            "perception": {
                "raw_text": text,
                "events": out_events,
                "meta": {"commit_time": commit_time, "truncated": false},
            }
        })),
        json!({"reason": "ok", "len_raw_text": len}),
    ))
}
