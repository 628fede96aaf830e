use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_bool, get_f64, get_i64, get_path, get_str,
    round4, truncate_chars, update,
};

use crate::common::{iso_from_ms, now_ms, parse_iso_ms, store_namespace, thread_id};

const MAX_AUDIT_ITEMS: usize = 50;
const INTROSPECTION_UNCERTAINTY: f64 = 0.7;

// ---------------------------------------------------------------- telemetry

fn metric(name: &str, value: f64, ts: &str, labels: Value) -> Value {
    json!({"name": name, "value": value, "ts": ts, "labels": labels})
}

fn audit(kind: &str, ts: &str, payload: Value) -> Value {
    json!({
        "id": content_hash(&json!({"k": kind, "p": &payload, "t": ts})),
        "kind": kind,
        "payload": payload,
        "ts": ts,
    })
}

fn persisted_ops<'a>(state: &'a Value, optimized: &[&str], raw: &[&str]) -> Vec<&'a Value> {
    get_array(state, optimized)
        .filter(|a| !a.is_empty())
        .or_else(|| get_array(state, raw))
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

/// Turn the tick's artifacts into labeled metrics, capped audit events, and
/// the compact summary the initiative scheduler consumes.
pub fn aggregate_telemetry(state: &Value) -> Result<StageOutcome> {
    let ts = iso_from_ms(now_ms(state));
    let tid = thread_id(state);
    let ns = store_namespace(state);
    let session_labels = json!({"thread_id": tid, "namespace": ns});

    let mut metrics: Vec<Value> = Vec::new();
    let mut audits: Vec<Value> = Vec::new();

    // Dialog
    let final_move = get_str(state, &["dialog", "final", "move"]).unwrap_or("unknown");
    let final_text = get_str(state, &["dialog", "final", "text"]).unwrap_or("");
    let out_len = final_text.chars().count();
    metrics.push(metric(
        "dialog_out_length",
        out_len as f64,
        &ts,
        json!({"thread_id": tid, "move": final_move}),
    ));

    // Plan
    let plan = get_path(state, &["planner", "plan"]);
    let must_confirm =
        get_bool(state, &["planner", "plan", "guardrails", "must_confirm"]).unwrap_or(false);
    metrics.push(metric(
        "plan_must_confirm",
        if must_confirm { 1.0 } else { 0.0 },
        &ts,
        json!({"thread_id": tid, "next_move": plan
            .and_then(|p| p.get("next_move"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")}),
    ));

    // Execution aggregate
    if let Some(agg) = get_path(state, &["executor", "results", "aggregate"]) {
        metrics.push(metric(
            "exec_total_cost",
            agg.get("total_cost").and_then(|c| c.as_f64()).unwrap_or(0.0),
            &ts,
            session_labels.clone(),
        ));
        metrics.push(metric(
            "exec_avg_latency_ms",
            agg.get("avg_latency_ms").and_then(|l| l.as_f64()).unwrap_or(0.0),
            &ts,
            session_labels.clone(),
        ));
        metrics.push(metric(
            "exec_items",
            agg.get("count").and_then(|c| c.as_f64()).unwrap_or(0.0),
            &ts,
            json!({
                "thread_id": tid,
                "ok": agg.get("ok").and_then(|o| o.as_i64()).unwrap_or(0),
                "errors": agg.get("errors").and_then(|e| e.as_i64()).unwrap_or(0),
            }),
        ));
    }

    // Persistence
    let wal_ops = get_array(state, &["memory", "wal", "ops"])
        .map(|a| a.len())
        .unwrap_or(0);
    if wal_ops > 0 {
        metrics.push(metric("wal_ops", wal_ops as f64, &ts, session_labels.clone()));
    }
    let apply_ops = persisted_ops(
        state,
        &["storage", "apply_optimized", "ops"],
        &["storage", "apply", "ops"],
    );
    if !apply_ops.is_empty() {
        let count_kind = |kind: &str| {
            apply_ops
                .iter()
                .filter(|op| op.get("op").and_then(|o| o.as_str()) == Some(kind))
                .count() as f64
        };
        metrics.push(metric("apply_ops", apply_ops.len() as f64, &ts, session_labels.clone()));
        metrics.push(metric("apply_puts", count_kind("put"), &ts, session_labels.clone()));
        metrics.push(metric("apply_incs", count_kind("inc"), &ts, session_labels.clone()));
        metrics.push(metric("apply_links", count_kind("link"), &ts, session_labels.clone()));
    }
    let index_items = persisted_ops(
        state,
        &["index", "queue_optimized", "items"],
        &["index", "queue", "items"],
    );
    if !index_items.is_empty() {
        metrics.push(metric(
            "index_queue_items",
            index_items.len() as f64,
            &ts,
            session_labels.clone(),
        ));
    }

    // World model
    let uncertainty = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
    metrics.push(metric(
        "wm_uncertainty",
        uncertainty,
        &ts,
        json!({
            "thread_id": tid,
            "reply_top": get_str(state, &["world_model", "prediction", "top"]).unwrap_or(""),
            "speech_act": get_str(state, &["world_model", "context", "features", "speech_act"]).unwrap_or(""),
        }),
    ));

    // Audit events
    if let Some(plan) = plan.filter(|p| p.get("skill_id").is_some() || p.get("skill_name").is_some()) {
        audits.push(audit(
            "plan_selected",
            &ts,
            json!({
                "plan_id": plan.get("id"),
                "skill_id": plan.get("skill_id"),
                "skill_name": plan.get("skill_name"),
                "must_confirm": must_confirm,
                "next_move": plan.get("next_move"),
                "thread_id": tid,
            }),
        ));
    }
    if let Some(best) = get_path(state, &["executor", "results", "best"])
        .filter(|b| b.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    {
        audits.push(audit(
            "exec_best",
            &ts,
            json!({
                "req_id": best.get("req_id"),
                "kind": best.get("kind"),
                "ok": best.get("ok").and_then(|o| o.as_bool()).unwrap_or(true),
                "score": best.get("score"),
                "duration_ms": best.get("duration_ms"),
                "thread_id": tid,
            }),
        ));
    }
    if final_move != "unknown" {
        audits.push(audit(
            "dialog_emit",
            &ts,
            json!({
                "move": final_move,
                "preview": truncate_chars(final_text, 240),
                "len": out_len,
                "thread_id": tid,
            }),
        ));
    }
    if wal_ops > 0 {
        audits.push(audit("wal_commit", &ts, json!({"ops": wal_ops, "thread_id": tid})));
    }
    if !apply_ops.is_empty() || !index_items.is_empty() {
        audits.push(audit(
            "storage_apply",
            &ts,
            json!({
                "apply_ops": apply_ops.len(),
                "index_items": index_items.len(),
                "thread_id": tid,
            }),
        ));
    }
    audits.truncate(MAX_AUDIT_ITEMS);

    // Summary read by the initiative scheduler.
    let new_rules = get_i64(state, &["concept_graph", "updates", "new_rules"]).unwrap_or(0);
    let summary = json!({
        "uncertainty": uncertainty,
        "needs_introspection": uncertainty >= INTROSPECTION_UNCERTAINTY,
        "concept_new_rules": new_rules,
    });

    let n_metrics = metrics.len();
    let n_audit = audits.len();
    Ok(StageOutcome::ok_with(
        update(json!({"observability": {"telemetry": {
            "metrics": metrics,
            "audit": audits,
            "summary": summary,
        }}})),
        json!({"reason": "ok", "counts": {"metrics": n_metrics, "audit": n_audit}}),
    ))
}

// ---------------------------------------------------------------- trace

fn span(name: &str, start_ms: i64, end_ms: i64, attrs: Value, parent: Option<&str>) -> Value {
    let start = iso_from_ms(start_ms);
    let end = iso_from_ms(end_ms.max(start_ms));
    json!({
        "id": content_hash(&json!({"n": name, "s": &start, "e": &end, "a": &attrs, "p": parent})),
        "name": name,
        "ts_start": start,
        "ts_end": end,
        "duration_ms": (end_ms - start_ms).max(0),
        "attrs": attrs,
        "parent": parent,
    })
}

fn wal_turn_time(state: &Value, role: &str) -> Option<i64> {
    get_array(state, &["memory", "wal", "ops"])?
        .iter()
        .filter(|op| op.get("op").and_then(|o| o.as_str()) == Some("append_turn"))
        .filter_map(|op| op.get("turn"))
        .filter(|t| t.get("role").and_then(|r| r.as_str()) == Some(role))
        .filter_map(|t| t.get("time").and_then(|t| t.as_str()))
        .filter_map(parse_iso_ms)
        .min()
}

/// Best-effort span tree for the turn, anchored on WAL commit times and the
/// tick clock. The trace is advisory; spans are synthesized, not measured.
pub fn build_trace(state: &Value) -> Result<StageOutcome> {
    let t_user = wal_turn_time(state, "user");
    let t_assistant = wal_turn_time(state, "assistant");
    let exec_dur = get_i64(state, &["executor", "results", "best", "duration_ms"]);
    let apply_n = persisted_ops(
        state,
        &["storage", "apply_optimized", "ops"],
        &["storage", "apply", "ops"],
    )
    .len() as i64;
    let index_n = persisted_ops(
        state,
        &["index", "queue_optimized", "items"],
        &["index", "queue", "items"],
    )
    .len() as i64;

    if t_user.is_none() && t_assistant.is_none() && exec_dur.is_none() && apply_n == 0 {
        return Ok(StageOutcome::skip("insufficient"));
    }

    let now = now_ms(state);
    let anchor = t_user
        .or_else(|| t_assistant.map(|t| t - exec_dur.unwrap_or(50).max(50)))
        .unwrap_or(now - 200);
    let plan_end = t_assistant
        .map(|t| t - exec_dur.unwrap_or(50).max(50))
        .unwrap_or(anchor + 80)
        .max(anchor);
    let exec_end = t_assistant.unwrap_or(plan_end + exec_dur.unwrap_or(60).max(20));
    let exec_start = (exec_end - exec_dur.unwrap_or(60)).max(plan_end);
    let persist_start = exec_end + 20;
    let persist_end = persist_start + 40 + 5 * (apply_n + index_n);

    let plan = get_path(state, &["planner", "plan"]);
    let root_attrs = json!({
        "plan_id": plan.and_then(|p| p.get("id")),
        "skill_id": plan.and_then(|p| p.get("skill_id")),
        "skill_name": plan.and_then(|p| p.get("skill_name")),
    });
    let root = span("turn", anchor, persist_end, root_attrs, None);
    let root_id = root["id"].as_str().unwrap_or("").to_string();

    let mut spans = vec![root];
    if let Some(t) = t_user {
        spans.push(span("turn.user", t, t + 10, json!({"role": "user"}), Some(&root_id)));
    }
    spans.push(span(
        "planner.plan",
        anchor,
        plan_end,
        json!({
            "next_move": plan.and_then(|p| p.get("next_move")),
            "must_confirm": get_bool(state, &["planner", "plan", "guardrails", "must_confirm"]).unwrap_or(false),
        }),
        Some(&root_id),
    ));
    spans.push(span(
        "executor.run",
        exec_start,
        exec_end,
        json!({
            "req_id": get_str(state, &["executor", "results", "best", "req_id"]),
            "count_items": get_i64(state, &["executor", "results", "aggregate", "count"]).unwrap_or(0),
        }),
        Some(&root_id),
    ));
    if let Some(t) = t_assistant {
        spans.push(span(
            "dialog.surface",
            exec_end.min(t - 10),
            t - 10,
            json!({"move": get_str(state, &["dialog", "turn", "move"]).unwrap_or("")}),
            Some(&root_id),
        ));
        spans.push(span(
            "dialog.final",
            t - 10,
            t,
            json!({"move": get_str(state, &["dialog", "final", "move"]).unwrap_or("")}),
            Some(&root_id),
        ));
    }
    if apply_n > 0 {
        spans.push(span(
            "storage.apply",
            persist_start,
            persist_start + 20 + 2 * apply_n,
            json!({"ops": apply_n}),
            Some(&root_id),
        ));
    }
    if index_n > 0 {
        spans.push(span(
            "index.queue",
            persist_start + 10,
            persist_end,
            json!({"items": index_n}),
            Some(&root_id),
        ));
    }

    let mut timeline: Vec<Value> = Vec::new();
    for sp in &spans {
        timeline.push(json!({"ts": sp["ts_start"], "name": format!("{}:start", sp["name"].as_str().unwrap_or("")), "ref": sp["id"]}));
        timeline.push(json!({"ts": sp["ts_end"], "name": format!("{}:end", sp["name"].as_str().unwrap_or("")), "ref": sp["id"]}));
    }
    timeline.sort_by(|a, b| {
        a["ts"]
            .as_str()
            .unwrap_or("")
            .cmp(b["ts"].as_str().unwrap_or(""))
    });

    let n_spans = spans.len();
    Ok(StageOutcome::ok_with(
        update(json!({"observability": {"trace": {"spans": spans, "timeline": timeline}}})),
        json!({"reason": "ok", "counts": {"spans": n_spans}}),
    ))
}

// ---------------------------------------------------------------- slo

/// Soft 0..1 score for a value against its threshold. `hi_good` flips the
/// direction: true means larger-is-better with `thresh` as the minimum.
fn ratio_good(x: f64, thresh: f64, hi_good: bool) -> f64 {
    if thresh <= 0.0 {
        let met = if hi_good { x >= thresh } else { x <= thresh };
        return if met { 1.0 } else { 0.0 };
    }
    if hi_good {
        // Full credit at the threshold, zero at half of it.
        if x >= thresh {
            1.0
        } else {
            ((x - 0.5 * thresh) / (0.5 * thresh)).clamp(0.0, 1.0)
        }
    } else if x <= thresh {
        1.0
    } else {
        // Linear decay from the threshold down to zero at twice it.
        ((2.0 * thresh - x) / thresh).clamp(0.0, 1.0)
    }
}

fn latest_metric(metrics: &[Value], name: &str) -> Option<Value> {
    metrics
        .iter()
        .rev()
        .find(|m| m.get("name").and_then(|n| n.as_str()) == Some(name))
        .cloned()
}

fn metric_value(metrics: &[Value], name: &str, default: f64) -> f64 {
    latest_metric(metrics, name)
        .and_then(|m| m.get("value").and_then(|v| v.as_f64()))
        .unwrap_or(default)
}

const SUGGESTED_KNOBS: [(&str, &str); 7] = [
    ("answer.length", "dialog.surface.max_len"),
    ("execution.latency_ms", "executor.timeout_ms"),
    ("execution.error_rate", "executor.retries.max"),
    ("execution.cost_usd", "budget.exec_total_cost_max"),
    ("storage.wal_ops", "persistence.batch.max_ops"),
    ("index.queue_items", "index.enqueue.rate_limit_per_s"),
    ("guardrails.must_confirm_adhered", "guardrails.must_confirm.u_threshold"),
];

/// Weighted soft SLO evaluation: each check ramps from 1.0 at its threshold
/// down to 0, the weighted sum is the 0..1 score, and failing checks become
/// alerts that suggest the knob to tune.
pub fn evaluate_slo(state: &Value) -> Result<StageOutcome> {
    let metrics: Vec<Value> = get_array(state, &["observability", "telemetry", "metrics"])
        .cloned()
        .unwrap_or_default();
    let agg = get_path(state, &["executor", "results", "aggregate"]);
    if metrics.is_empty() && agg.is_none() {
        return Ok(StageOutcome::skip("no_metrics"));
    }

    let agg_f = |key: &str| {
        agg.and_then(|a| a.get(key)).and_then(|v| v.as_f64()).unwrap_or(0.0)
    };
    let out_len = metric_value(&metrics, "dialog_out_length", 0.0);
    let latency = metric_value(&metrics, "exec_avg_latency_ms", agg_f("avg_latency_ms"));
    let total_cost = metric_value(&metrics, "exec_total_cost", agg_f("total_cost"));
    let wal_ops = metric_value(&metrics, "wal_ops", 0.0);
    let idx_items = metric_value(&metrics, "index_queue_items", 0.0);

    let items_metric = latest_metric(&metrics, "exec_items");
    let ok_n = items_metric
        .as_ref()
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get("ok"))
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| agg_f("ok"));
    let err_n = items_metric
        .as_ref()
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get("errors"))
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| agg_f("errors"));
    let err_rate = err_n / (ok_n + err_n).max(1.0);

    let must_confirm =
        get_bool(state, &["planner", "plan", "guardrails", "must_confirm"]).unwrap_or(false);
    let final_move = get_str(state, &["dialog", "final", "move"])
        .or_else(|| get_str(state, &["dialog", "turn", "move"]))
        .unwrap_or("");
    let final_reason = get_str(state, &["dialog", "final", "reason"]).unwrap_or("");
    let confirm_ok = !must_confirm
        || final_move == "confirm"
        || final_reason == "must_confirm"
        || final_reason == "secret_detected";

    let mut checks: Vec<Value> = Vec::new();
    let mut score_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut add_check = |name: &str, value: f64, thresh: f64, hi_good: bool, weight: f64, details: Value| {
        let s = ratio_good(value, thresh, hi_good);
        let mut d = details.as_object().cloned().unwrap_or_else(Map::new);
        d.insert("score".to_string(), json!(round4(s)));
        checks.push(json!({
            "name": name, "ok": s >= 1.0, "value": value, "threshold": thresh,
            "weight": weight, "details": d,
        }));
        score_sum += s * weight;
        weight_sum += weight;
    };

    add_check("answer.length", out_len, 900.0, false, 0.12, json!({}));
    add_check("execution.latency_ms", latency, 1500.0, false, 0.22, json!({}));
    add_check(
        "execution.error_rate",
        err_rate,
        0.2,
        false,
        0.26,
        json!({"errors": err_n, "count": ok_n + err_n}),
    );
    add_check("execution.cost_usd", total_cost, 0.01, false, 0.18, json!({}));
    add_check("storage.wal_ops", wal_ops, 80.0, false, 0.10, json!({}));
    add_check("index.queue_items", idx_items, 1000.0, false, 0.07, json!({}));
    add_check(
        "guardrails.must_confirm_adhered",
        if confirm_ok { 1.0 } else { 0.0 },
        1.0,
        true,
        0.05,
        json!({"must_confirm": must_confirm, "final_move": final_move, "reason": final_reason}),
    );

    let score = round4(score_sum / weight_sum.max(1e-9));

    let mut alerts: Vec<Value> = Vec::new();
    for c in &checks {
        if c["ok"].as_bool().unwrap_or(false) {
            continue;
        }
        let weight = c["weight"].as_f64().unwrap_or(0.0);
        let severity = if weight >= 0.22 {
            "high"
        } else if weight >= 0.12 {
            "medium"
        } else {
            "low"
        };
        let name = c["name"].as_str().unwrap_or("");
        let value = c["value"].as_f64().unwrap_or(0.0);
        let thresh = c["threshold"].as_f64().unwrap_or(0.0);
        let suggest = SUGGESTED_KNOBS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, knob)| *knob)
            .unwrap_or("manual_review");
        alerts.push(json!({
            "severity": severity,
            "title": format!("slo check failed: {name}"),
            "summary": format!("value={value} threshold={thresh} (delta={})", round4(value - thresh)),
            "suggest": suggest,
            "tags": {"name": name},
        }));
    }

    Ok(StageOutcome::ok(update(json!({"observability": {"slo": {
        "score": score,
        "checks": checks,
        "alerts": alerts,
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_state() -> Value {
        json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-007"},
            "world_model": {"prediction": {"top": "execute_action"},
                            "context": {"features": {"speech_act": "request"}},
                            "uncertainty": {"score": 0.42}},
            "planner": {"plan": {"id": "p1", "skill_id": "skill.sum", "skill_name": "Summarizer",
                                 "next_move": "execute", "guardrails": {"must_confirm": true}}},
            "dialog": {"final": {"move": "confirm", "text": "Confirm to run 'Summarizer'"}},
            "executor": {"results": {
                "aggregate": {"count": 2, "ok": 1, "errors": 1, "total_cost": 0.0023, "avg_latency_ms": 640.5},
                "best": {"req_id": "r1", "ok": true, "kind": "json", "score": 0.72, "duration_ms": 540},
            }},
            "memory": {"wal": {"ops": [{"op": "append_turn", "turn": {"role": "user", "time": "2026-01-01T00:00:00Z"}},
                                        {"op": "bump_counters", "keys": {"turns": 1}}]}},
            "storage": {"apply_optimized": {"ops": [{"op": "put"}, {"op": "inc"}]}},
            "index": {"queue_optimized": {"items": [{"type": "packz", "id": "u1", "ns": "store/cognit/t-007"}]}},
        })
    }

    #[test]
    fn telemetry_emits_metrics_and_audits() {
        let out = aggregate_telemetry(&telemetry_state()).unwrap();
        let tel = &out.update["observability"]["telemetry"];
        let names: Vec<&str> = tel["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        for expected in ["dialog_out_length", "exec_total_cost", "exec_avg_latency_ms", "wal_ops", "apply_ops", "index_queue_items", "wm_uncertainty"] {
            assert!(names.contains(&expected), "missing metric {expected}");
        }
        let kinds: Vec<&str> = tel["audit"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["kind"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"plan_selected"));
        assert!(kinds.contains(&"dialog_emit"));
    }

    #[test]
    fn slo_scores_soft_and_alerts_with_knobs() {
        let state = json!({"observability": {"telemetry": {"metrics": [
            {"name": "exec_avg_latency_ms", "value": 1800.0, "labels": {}},
            {"name": "exec_total_cost", "value": 0.013, "labels": {}},
            {"name": "dialog_out_length", "value": 120.0, "labels": {}},
        ]}}});
        let out = evaluate_slo(&state).unwrap();
        let slo = &out.update["observability"]["slo"];
        let score = slo["score"].as_f64().unwrap();
        assert!(score > 0.0 && score < 1.0, "score was {score}");
        let alerts = slo["alerts"].as_array().unwrap();
        let latency_alert = alerts
            .iter()
            .find(|a| a["tags"]["name"] == json!("execution.latency_ms"))
            .expect("latency alert present");
        assert_eq!(latency_alert["suggest"], json!("executor.timeout_ms"));
        assert_eq!(latency_alert["severity"], json!("high"));
    }

    #[test]
    fn slo_perfect_state_scores_one() {
        let state = json!({"observability": {"telemetry": {"metrics": [
            {"name": "dialog_out_length", "value": 80.0, "labels": {}},
            {"name": "exec_avg_latency_ms", "value": 300.0, "labels": {}},
        ]}}});
        let out = evaluate_slo(&state).unwrap();
        assert_eq!(out.update["observability"]["slo"]["score"], json!(1.0));
    }

    #[test]
    fn trace_builds_rooted_span_tree() {
        let out = build_trace(&telemetry_state()).unwrap();
        let spans = out.update["observability"]["trace"]["spans"].as_array().unwrap();
        assert!(spans.len() >= 4);
        let root = &spans[0];
        assert_eq!(root["name"], json!("turn"));
        assert!(root["parent"].is_null());
        assert!(spans[1..].iter().all(|s| s["parent"] == root["id"]));
    }

    #[test]
    fn introspection_summary_tracks_uncertainty() {
        let mut state = telemetry_state();
        state["world_model"]["uncertainty"]["score"] = json!(0.85);
        let out = aggregate_telemetry(&state).unwrap();
        let summary = &out.update["observability"]["telemetry"]["summary"];
        assert_eq!(summary["needs_introspection"], json!(true));
    }
}
