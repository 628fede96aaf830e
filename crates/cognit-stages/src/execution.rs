use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_path, get_str, round2, round6, truncate_chars,
    update,
};

const DEFAULT_TIMEOUT_MS: i64 = 30_000;
const MAX_TEXT: usize = 8000;
const MAX_ATTACHMENTS: usize = 12;
const MAX_TABLE_ROWS: usize = 6;
const MAX_TABLE_COLS: usize = 8;
const PRESENT_MAX: usize = 1200;

// ---------------------------------------------------------------- dispatch

/// Turn the dialog's execute ops into executor requests. Nothing dispatches
/// when the final move is not `execute` or a confirmation gate is pending;
/// `req_id` is a hash of (skill, params, plan id) and doubles as the
/// idempotency key.
pub fn dispatch(state: &Value) -> Result<StageOutcome> {
    let final_move = get_str(state, &["dialog", "final", "move"]).unwrap_or("");
    if !final_move.is_empty() && final_move != "execute" {
        return Ok(StageOutcome::skip("not_execute_move"));
    }
    let reason = get_str(state, &["dialog", "final", "reason"]).unwrap_or("");
    if reason == "must_confirm" || reason == "secret_detected" {
        return Ok(StageOutcome::skip(reason));
    }

    let turn_ops = get_array(state, &["dialog", "turn", "ops"])
        .filter(|o| !o.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            get_array(state, &["planner", "plan", "steps"])
                .cloned()
                .unwrap_or_default()
        });
    let ops: Vec<&Value> = turn_ops
        .iter()
        .filter(|op| op.get("op").and_then(|o| o.as_str()) == Some("execute_skill"))
        .collect();
    if ops.is_empty() {
        return Ok(StageOutcome::skip("no_ops"));
    }

    let plan_id = get_str(state, &["planner", "plan", "id"])
        .or_else(|| get_str(state, &["dialog", "turn", "meta", "plan_id"]))
        .unwrap_or("");

    let mut requests: Vec<Value> = Vec::new();
    for op in &ops {
        let Some(skill_id) = op.get("skill_id").and_then(|s| s.as_str()).filter(|s| !s.is_empty())
        else {
            continue;
        };
        let params = op.get("params").cloned().unwrap_or_else(|| json!({}));
        let key = content_hash(&json!({"skill_id": skill_id, "params": &params, "plan": plan_id}));
        requests.push(json!({
            "req_id": key,
            "skill_id": skill_id,
            "params": params,
            "timeout_ms": DEFAULT_TIMEOUT_MS,
            "retries": {"max": 2, "policy": "exponential", "backoff_ms": 1200},
            "idempotency_key": key,
            "meta": {"plan_id": plan_id, "skill_name": op.get("skill_name")},
        }));
    }

    let n_ops = ops.len();
    let n_req = requests.len();
    Ok(StageOutcome::ok_with(
        update(json!({"executor": {"requests": requests}})),
        json!({"reason": "ok", "counts": {"ops": n_ops, "requests": n_req}}),
    ))
}

// ---------------------------------------------------------------- normalize

fn is_table_like(v: &Value) -> bool {
    let Some(rows) = v.as_array().filter(|r| !r.is_empty()) else {
        return false;
    };
    let Some(first) = rows[0].as_object() else {
        return false;
    };
    let keys: Vec<&String> = first.keys().collect();
    rows.iter().take(10).all(|r| {
        r.as_object()
            .map(|o| o.len() == keys.len() && keys.iter().all(|k| o.contains_key(*k)))
            .unwrap_or(false)
    })
}

fn infer_kind(content: Option<&Value>, mime: Option<&str>) -> &'static str {
    if let Some(mime) = mime {
        let m = mime.to_lowercase();
        if m.starts_with("text/markdown") || m == "text/md" {
            return "markdown";
        }
        if m.starts_with("text/") {
            return "text";
        }
        if m.ends_with("/json") {
            return "json";
        }
        if m.starts_with("image/") {
            return "image";
        }
        if m.starts_with("application/octet-stream") {
            return "binary";
        }
    }
    match content {
        Some(Value::Array(_)) | Some(Value::Object(_)) => {
            if content.map(is_table_like).unwrap_or(false) {
                "table"
            } else {
                "json"
            }
        }
        Some(Value::String(s)) => {
            let t = s.trim().to_lowercase();
            if t.starts_with("http://") || t.starts_with("https://") {
                "url"
            } else {
                "text"
            }
        }
        _ => "unknown",
    }
}

fn approx_tokens(s: &str) -> i64 {
    if s.is_empty() { 0 } else { ((s.len() + 3) / 4).max(1) as i64 }
}

fn normalize_one(resp: &Value) -> Value {
    let req_id = resp.get("req_id").and_then(|r| r.as_str()).unwrap_or("");
    let mut ok = resp.get("ok").and_then(|b| b.as_bool()).unwrap_or(true);
    let mime = resp.get("mime").and_then(|m| m.as_str());
    let content = resp
        .get("content")
        .or_else(|| resp.get("text"))
        .or_else(|| resp.get("data"));

    let mut kind = infer_kind(content, mime);
    let mut text = String::new();
    let mut data = Value::Null;
    let mut attachments: Vec<Value> = resp
        .get("attachments")
        .and_then(|a| a.as_array())
        .map(|a| a.iter().filter(|x| x.is_object()).cloned().collect())
        .unwrap_or_default();

    match kind {
        "text" | "markdown" | "url" => {
            if let Some(Value::String(s)) = content {
                text = truncate_chars(s.trim(), MAX_TEXT);
            }
        }
        "json" | "table" => {
            data = content.cloned().unwrap_or(Value::Null);
            text = truncate_chars(&cognit_types::canonical_json(&data), MAX_TEXT);
        }
        "image" | "binary" => {
            if let Some(Value::String(s)) = content {
                let t = s.trim().to_lowercase();
                if t.starts_with("http://") || t.starts_with("https://") {
                    attachments.push(json!({"type": kind, "ref": s}));
                }
            }
            if let Some(t) = resp.get("text").and_then(|t| t.as_str()) {
                text = truncate_chars(t, MAX_TEXT);
            }
        }
        _ => {
            if let Some(c) = content {
                text = truncate_chars(&render_plain(c), MAX_TEXT);
            }
        }
    }
    attachments.truncate(MAX_ATTACHMENTS);

    let usage = resp.get("usage").cloned().unwrap_or_else(|| json!({}));
    let input_tokens = usage.get("input_tokens").and_then(|t| t.as_i64()).unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| approx_tokens(&text));
    let cost = usage.get("cost").and_then(|c| c.as_f64()).unwrap_or(0.0);
    let duration_ms = resp
        .get("duration_ms")
        .or_else(|| resp.get("latency_ms"))
        .and_then(|d| d.as_i64())
        .unwrap_or(0);

    if let Some(err) = resp.get("error").filter(|e| e.is_object()) {
        ok = false;
        kind = "error";
        if text.is_empty() {
            text = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("execution failed")
                .to_string();
        }
    }

    // Score: success first, then content richness, then informative length.
    let mut richness: f64 = 0.0;
    match kind {
        "table" => richness = 0.35,
        "json" => richness = 0.25,
        "markdown" => richness = 0.15,
        "text" => richness = 0.1,
        _ => {}
    }
    if !attachments.is_empty() {
        richness += (0.05 * attachments.len() as f64).min(0.2);
    }
    let length_bonus = if text.is_empty() {
        0.0
    } else {
        ((text.len() as f64 - 80.0) / 500.0).clamp(0.0, 0.2)
    };
    let score = round6(if ok { 0.5 } else { 0.0 } + richness + length_bonus);

    json!({
        "req_id": req_id,
        "ok": ok,
        "kind": kind,
        "text": text,
        "data": data,
        "attachments": attachments,
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens, "cost": round6(cost)},
        "duration_ms": duration_ms,
        "score": score,
        "meta": {"mime": mime},
    })
}

fn render_plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten raw skill responses into normalized result items with a best pick
/// and an aggregate.
pub fn normalize_results(state: &Value) -> Result<StageOutcome> {
    let raw = get_array(state, &["executor", "responses"])
        .filter(|r| !r.is_empty())
        .or_else(|| get_array(state, &["executor", "raw"]).filter(|r| !r.is_empty()));
    let Some(raw) = raw else {
        return Ok(StageOutcome::skip("no_responses"));
    };

    let mut items: Vec<Value> = raw
        .iter()
        .filter(|r| r.is_object())
        .map(normalize_one)
        .collect();

    let mut total_cost = 0.0;
    let (mut total_in, mut total_out, mut lat_sum) = (0i64, 0i64, 0i64);
    let (mut ok_n, mut err_n) = (0usize, 0usize);
    for it in &items {
        total_cost += it["usage"]["cost"].as_f64().unwrap_or(0.0);
        total_in += it["usage"]["input_tokens"].as_i64().unwrap_or(0);
        total_out += it["usage"]["output_tokens"].as_i64().unwrap_or(0);
        lat_sum += it["duration_ms"].as_i64().unwrap_or(0);
        if it["ok"].as_bool().unwrap_or(false) {
            ok_n += 1;
        } else {
            err_n += 1;
        }
    }

    items.sort_by(|a, b| {
        let ok_a = a["ok"].as_bool().unwrap_or(false);
        let ok_b = b["ok"].as_bool().unwrap_or(false);
        ok_b.cmp(&ok_a).then_with(|| {
            b["score"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&a["score"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    let best = items.first().cloned().unwrap_or(Value::Null);
    let count = items.len();

    Ok(StageOutcome::ok(update(json!({"executor": {"results": {
        "items": items,
        "best": best,
        "aggregate": {
            "count": count,
            "ok": ok_n,
            "errors": err_n,
            "total_cost": round6(total_cost),
            "total_input_tokens": total_in,
            "total_output_tokens": total_out,
            "avg_latency_ms": round2(lat_sum as f64 / count.max(1) as f64),
        },
    }}}))))
}

// ---------------------------------------------------------------- present

fn table_markdown(rows: &[Value]) -> String {
    let Some(first) = rows.first().and_then(|r| r.as_object()) else {
        return String::new();
    };
    let cols: Vec<&String> = first.keys().take(MAX_TABLE_COLS).collect();
    let head = format!(
        "| {} |",
        cols.iter()
            .map(|c| truncate_chars(c, 40))
            .collect::<Vec<_>>()
            .join(" | ")
    );
    let sep = format!("| {} |", cols.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    let mut lines = vec![head, sep];
    for row in rows.iter().take(MAX_TABLE_ROWS) {
        let cells: Vec<String> = cols
            .iter()
            .map(|c| {
                row.get(c.as_str())
                    .map(|v| truncate_chars(&render_plain(v), 80))
                    .unwrap_or_default()
            })
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

fn attachments_list(atts: &[Value]) -> String {
    if atts.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = atts
        .iter()
        .take(MAX_ATTACHMENTS)
        .map(|a| {
            let kind = a.get("type").and_then(|t| t.as_str()).unwrap_or("file");
            let r = a
                .get("ref")
                .or_else(|| a.get("url"))
                .and_then(|r| r.as_str())
                .unwrap_or("");
            format!("- {kind}: {r}")
        })
        .collect();
    format!("\n\nAttachments:\n{}", lines.join("\n"))
}

/// Compose a dialog turn out of the best normalized result: markdown tables
/// for tabular data, attachment listings, plain failure text otherwise.
pub fn present_results(state: &Value) -> Result<StageOutcome> {
    let Some(results) = get_path(state, &["executor", "results"]) else {
        return Ok(StageOutcome::skip("no_results"));
    };
    let items = results.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
    let best = results
        .get("best")
        .filter(|b| b.is_object())
        .cloned()
        .or_else(|| items.first().cloned());
    let Some(best) = best else {
        return Ok(StageOutcome::skip("no_results"));
    };

    let ok = best.get("ok").and_then(|b| b.as_bool()).unwrap_or(true);
    let kind = best.get("kind").and_then(|k| k.as_str()).unwrap_or("text");
    let text = best.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let data = best.get("data");
    let atts = best
        .get("attachments")
        .and_then(|a| a.as_array())
        .cloned()
        .unwrap_or_default();
    let skill_name = get_str(state, &["planner", "plan", "skill_name"]);

    let body = if !ok {
        let msg = if text.is_empty() { "The operation failed." } else { text };
        msg.to_string()
    } else {
        match kind {
            "json" | "table" if data.map(is_table_like).unwrap_or(false) => {
                let rows = data.and_then(|d| d.as_array()).cloned().unwrap_or_default();
                format!("Top results:\n\n{}{}", table_markdown(&rows), attachments_list(&atts))
            }
            "text" | "markdown" | "url" | "json" => {
                let lead = if text.is_empty() { "Done." } else { text };
                format!("{lead}{}", attachments_list(&atts))
            }
            _ => {
                let lead = if text.is_empty() { "The result is ready." } else { text };
                format!("{lead}{}", attachments_list(&atts))
            }
        }
    };
    let content = truncate_chars(&body, PRESENT_MAX);
    let (mv, content) = if content.is_empty() {
        ("ack", "Okay.".to_string())
    } else {
        ("answer", content)
    };

    let n_items = items.len();
    Ok(StageOutcome::ok_with(
        update(json!({"dialog": {"turn": {
            "move": mv,
            "content": content,
            "attachments": atts.iter().take(MAX_ATTACHMENTS).collect::<Vec<_>>(),
            "meta": {"skill_name": skill_name},
        }}})),
        json!({"reason": "ok", "counts": {"items": n_items}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::Status;

    #[test]
    fn dispatch_requires_execute_move() {
        let state = json!({
            "dialog": {"final": {"move": "confirm"},
                       "turn": {"ops": [{"op": "execute_skill", "skill_id": "skill.echo", "params": {}}]}},
        });
        let out = dispatch(&state).unwrap();
        assert_eq!(out.status, Status::Skip);
        assert_eq!(out.reason(), Some("not_execute_move"));
    }

    #[test]
    fn dispatch_builds_deterministic_request_ids() {
        let state = json!({
            "dialog": {"final": {"move": "execute"},
                       "turn": {"ops": [{"op": "execute_skill", "skill_id": "skill.echo",
                                          "skill_name": "Echo", "params": {"msg": "hi"}}]}},
            "planner": {"plan": {"id": "plan-1"}},
        });
        let a = dispatch(&state).unwrap();
        let b = dispatch(&state).unwrap();
        let req_a = &a.update["executor"]["requests"][0];
        let req_b = &b.update["executor"]["requests"][0];
        assert_eq!(req_a["req_id"], req_b["req_id"]);
        assert_eq!(req_a["req_id"], req_a["idempotency_key"]);
    }

    #[test]
    fn confirm_gate_blocks_dispatch() {
        let state = json!({
            "dialog": {"final": {"move": "execute", "reason": "must_confirm"},
                       "turn": {"ops": [{"op": "execute_skill", "skill_id": "skill.echo", "params": {}}]}},
        });
        let out = dispatch(&state).unwrap();
        assert_eq!(out.status, Status::Skip);
        assert_eq!(out.reason(), Some("must_confirm"));
    }

    #[test]
    fn normalization_aggregates_and_ranks() {
        let state = json!({"executor": {"responses": [
            {"req_id": "r1", "ok": true, "mime": "application/json",
             "content": [{"title": "A", "value": 1}, {"title": "B", "value": 2}],
             "usage": {"input_tokens": 120, "output_tokens": 80, "cost": 0.0021},
             "duration_ms": 740},
            {"req_id": "r2", "ok": false,
             "error": {"type": "Timeout", "message": "skill timed out"},
             "duration_ms": 30000},
        ]}});
        let out = normalize_results(&state).unwrap();
        let results = &out.update["executor"]["results"];
        assert_eq!(results["aggregate"]["count"], json!(2));
        assert_eq!(results["aggregate"]["ok"], json!(1));
        assert_eq!(results["aggregate"]["errors"], json!(1));
        assert_eq!(results["best"]["req_id"], json!("r1"));
        assert_eq!(results["best"]["kind"], json!("json"));
    }

    #[test]
    fn error_results_present_failure_text() {
        let state = json!({"executor": {"results": {
            "items": [{"ok": false, "kind": "error", "text": "skill timed out", "attachments": []}],
            "best": {"ok": false, "kind": "error", "text": "skill timed out", "attachments": []},
        }}});
        let out = present_results(&state).unwrap();
        let turn = &out.update["dialog"]["turn"];
        assert_eq!(turn["move"], json!("answer"));
        assert_eq!(turn["content"], json!("skill timed out"));
    }

    #[test]
    fn tables_render_as_markdown() {
        let rows = json!([{"title": "A", "value": 1}, {"title": "B", "value": 2}]);
        let state = json!({"executor": {"results": {
            "items": [], "best": {"ok": true, "kind": "table", "text": "", "data": rows, "attachments": []},
        }}});
        let out = present_results(&state).unwrap();
        let content = out.update["dialog"]["turn"]["content"].as_str().unwrap();
        assert!(content.contains("| title | value |"));
        assert!(content.contains("| A | 1 |"));
    }
}
