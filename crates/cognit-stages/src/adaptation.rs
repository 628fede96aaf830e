use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{
    REPLY_LABELS, StageOutcome, content_hash, get_array, get_dotted, get_f64, get_i64,
    get_path, get_str, round4, round6, set_dotted, update,
};

use crate::common::{config_namespace, iso_from_ms, now_ms, parse_iso_ms};

const TRACE_CONSIDER: usize = 12;
const LEARNING_RATE_BASE: f64 = 0.18;
const CONFIDENCE_DECAY: f64 = 0.4;
const WEIGHT_MIN: f64 = 0.0;
const WEIGHT_MAX: f64 = 1.5;
const CONFIDENCE_MIN: f64 = 0.05;
const CONFIDENCE_MAX: f64 = 0.99;
const MAX_CHANGES_PER_TURN: usize = 8;
const DELTA_TTL_SECONDS: i64 = 1800;

// ---------------------------------------------------------------- learning

struct TraceItem {
    reward: f64,
    target: Option<String>,
    actual: Option<String>,
    top_pred: Option<String>,
}

fn learning_trace(state: &Value) -> Vec<TraceItem> {
    let Some(items) = get_array(state, &["world_model", "trace", "error_history"]) else {
        return Vec::new();
    };
    items
        .iter()
        .rev()
        .take(TRACE_CONSIDER)
        .rev()
        .filter_map(|it| {
            Some(TraceItem {
                reward: it.get("reward")?.as_f64()?,
                target: it.get("target").and_then(|t| t.as_str()).map(str::to_string),
                actual: it.get("actual").and_then(|t| t.as_str()).map(str::to_string),
                top_pred: it.get("top_pred").and_then(|t| t.as_str()).map(str::to_string),
            })
        })
        .collect()
}

fn base_weights(state: &Value) -> Map<String, Value> {
    let learned = get_path(state, &["policy", "learning", "weights"]).and_then(|w| w.as_object());
    REPLY_LABELS
        .iter()
        .map(|l| {
            let w = learned
                .and_then(|m| m.get(*l))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            (l.to_string(), json!(w))
        })
        .collect()
}

fn clip_weight(w: f64) -> f64 {
    w.clamp(WEIGHT_MIN, WEIGHT_MAX)
}

/// Reinforcement-style weight update over the error trace. Weights stay in
/// [0, 1.5] and confidence in [0.05, 0.99]; an empty trace changes nothing.
fn plan_learning(state: &Value) -> Value {
    let weights = base_weights(state);
    let trace = learning_trace(state);
    let uncertainty = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
    let prev_version = get_path(state, &["policy", "learning", "version"])
        .cloned()
        .unwrap_or_else(|| json!({}));
    let prev_id = prev_version.get("id").and_then(|i| i.as_str()).map(str::to_string);

    if trace.is_empty() {
        let confidence = (1.0 - uncertainty).max(CONFIDENCE_MIN);
        return json!({
            "version": prev_version,
            "weights": weights,
            "rollback": get_path(state, &["policy", "learning", "rollback"]).cloned().unwrap_or_else(|| json!({})),
            "summary": {"avg_reward": 0.0, "updates": 0, "confidence": round4(confidence), "delta_norm": 0.0},
            "delta": {},
        });
    }

    let lr = LEARNING_RATE_BASE * (1.0 - 0.5 * uncertainty);
    let mut updated = weights.clone();
    let mut total_reward = 0.0;
    let mut delta_norm = 0.0;
    let mut bump = |map: &mut Map<String, Value>, label: &Option<String>, delta: f64| {
        let Some(label) = label else { return };
        let Some(cur) = map.get(label).and_then(|v| v.as_f64()) else {
            return;
        };
        map.insert(label.clone(), json!(clip_weight(cur + delta)));
        delta_norm += delta.abs();
    };

    for item in &trace {
        total_reward += item.reward;
        bump(&mut updated, &item.target, lr * item.reward);
        bump(&mut updated, &item.actual, lr * (item.reward - 0.5));
        if item.top_pred.is_some() && item.top_pred != item.target {
            bump(&mut updated, &item.top_pred, -lr * (0.6 - item.reward));
        }
    }

    let avg_reward = total_reward / trace.len() as f64;
    let confidence = (0.5 * (1.0 - uncertainty) + 0.5 * avg_reward)
        .clamp(CONFIDENCE_MIN, CONFIDENCE_MAX);
    let summary = json!({
        "avg_reward": round4(avg_reward),
        "updates": trace.len(),
        "confidence": round4(confidence),
        "delta_norm": round4(delta_norm),
    });

    let rounded: Map<String, Value> = updated
        .iter()
        .map(|(k, v)| (k.clone(), json!(round6(v.as_f64().unwrap_or(0.5)))))
        .collect();
    let version_id = content_hash(&json!({
        "parent_id": &prev_id,
        "weights": &rounded,
        "summary": &summary,
    }));
    let delta: Map<String, Value> = REPLY_LABELS
        .iter()
        .filter_map(|l| {
            let new = rounded.get(*l)?.as_f64()?;
            let old = weights.get(*l)?.as_f64()?;
            let d = new - old;
            if d.abs() >= 1e-6 {
                Some((l.to_string(), json!(round6(d))))
            } else {
                None
            }
        })
        .collect();

    json!({
        "version": {"id": version_id, "parent_id": prev_id},
        "weights": rounded,
        "rollback": {
            "version": prev_version.get("id"),
            "weights": weights,
        },
        "summary": summary,
        "delta": delta,
        "trace_used": trace.len(),
    })
}

// ---------------------------------------------------------------- delta

fn change(
    path: &str,
    new_value: Value,
    change_type: &str,
    rationale: &str,
    confidence: f64,
    bounds: Option<(f64, f64)>,
) -> Value {
    let mut ch = json!({
        "path": path,
        "new_value": new_value,
        "change_type": change_type,
        "rationale": rationale,
        "confidence": round4(confidence.clamp(0.0, 1.0)),
    });
    if let Some((min, max)) = bounds {
        ch["bounds"] = json!({"min": min, "max": max});
    }
    ch
}

fn metric_lookup(state: &Value, name: &str, fallback: f64) -> f64 {
    get_array(state, &["observability", "telemetry", "metrics"])
        .and_then(|metrics| {
            metrics
                .iter()
                .rev()
                .find(|m| m.get("name").and_then(|n| n.as_str()) == Some(name))
        })
        .and_then(|m| m.get("value"))
        .and_then(|v| v.as_f64())
        .unwrap_or(fallback)
}

fn changes_from_checks(state: &Value, checks: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for c in checks {
        if c.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
            continue;
        }
        let name = c.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let score = c
            .get("details")
            .and_then(|d| d.get("score"))
            .and_then(|s| s.as_f64())
            .unwrap_or(0.0);
        match name {
            "answer.length" => {
                let conf = 0.55 + 0.2 * (1.0 - score);
                out.push(change(
                    "dialog.surface.max_len",
                    json!(720),
                    "tighten",
                    "Answer length exceeded budget.",
                    conf,
                    Some((400.0, 2000.0)),
                ));
                out.push(change(
                    "safety_filter.max_out_len",
                    json!(1080),
                    "tighten",
                    "Safety cap should track the dialog cap.",
                    conf,
                    Some((600.0, 4000.0)),
                ));
            }
            "execution.latency_ms" => {
                out.push(change(
                    "executor.timeout_ms",
                    json!(27_000),
                    "tighten",
                    "High average latency; fail faster.",
                    0.6 + 0.25 * (1.0 - score),
                    Some((8000.0, 60_000.0)),
                ));
            }
            "execution.error_rate" => {
                let latency = metric_lookup(
                    state,
                    "exec_avg_latency_ms",
                    get_f64(state, &["executor", "results", "aggregate", "avg_latency_ms"])
                        .unwrap_or(0.0),
                );
                if latency <= 1.05 * 1500.0 {
                    out.push(change(
                        "executor.retries.max",
                        json!(3),
                        "relax",
                        "Error rate high with acceptable latency; allow one more retry.",
                        0.58,
                        Some((0.0, 6.0)),
                    ));
                } else {
                    out.push(change(
                        "executor.parallelism.max_inflight",
                        json!(2),
                        "tighten",
                        "Error rate and latency both high; limit inflight calls.",
                        0.52,
                        Some((1.0, 8.0)),
                    ));
                }
            }
            "execution.cost_usd" => {
                out.push(change(
                    "budget.exec_total_cost_max",
                    json!(0.0085),
                    "tighten",
                    "Execution cost over budget; lower the per-turn budget.",
                    0.62,
                    Some((0.002, 0.05)),
                ));
                out.push(change(
                    "planner.skill_selection.cost_bias",
                    json!(0.15),
                    "retune",
                    "Favor cheaper skills under cost pressure.",
                    0.55,
                    Some((0.0, 0.5)),
                ));
            }
            "storage.wal_ops" => {
                out.push(change(
                    "persistence.batch.max_ops",
                    json!(50),
                    "retune",
                    "High WAL volume; batch harder.",
                    0.57,
                    Some((20.0, 200.0)),
                ));
            }
            "index.queue_items" => {
                out.push(change(
                    "index.enqueue.rate_limit_per_s",
                    json!(30),
                    "tighten",
                    "Large index queue; rate-limit enqueue.",
                    0.54,
                    Some((10.0, 200.0)),
                ));
            }
            "guardrails.must_confirm_adhered" => {
                let u = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
                let thresh = if u >= 0.45 { 0.35 } else { 0.4 };
                out.push(change(
                    "guardrails.must_confirm.u_threshold",
                    json!(thresh),
                    "tighten",
                    "Confirmation was not adhered to; be more conservative.",
                    0.64,
                    Some((0.25, 0.7)),
                ));
            }
            _ => {}
        }
    }
    out
}

fn changes_from_world_model(state: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    let rewards: Vec<f64> = get_array(state, &["world_model", "trace", "error_history"])
        .map(|items| {
            items
                .iter()
                .rev()
                .take(TRACE_CONSIDER)
                .filter_map(|it| it.get("reward").and_then(|r| r.as_f64()))
                .collect()
        })
        .unwrap_or_default();
    let avg = if rewards.is_empty() {
        0.0
    } else {
        rewards.iter().sum::<f64>() / rewards.len() as f64
    };
    let uncertainty = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);

    if !rewards.is_empty() && avg < 0.35 {
        out.push(change(
            "planner.learning.reward_bias",
            json!(0.15),
            "retune",
            "Prediction reward is low; bias toward clarification.",
            0.55,
            None,
        ));
    } else if avg > 0.75 && uncertainty < 0.4 {
        out.push(change(
            "planner.learning.reward_bias",
            json!(0.05),
            "relax",
            "High reward and low uncertainty; allow more direct answers.",
            0.5,
            Some((0.0, 0.3)),
        ));
    }
    let recent: Vec<f64> = rewards.iter().rev().take(3).copied().collect();
    if !recent.is_empty() && recent.iter().map(|r| if *r >= 0.6 { 1 } else { -1 }).sum::<i32>() < 0 {
        out.push(change(
            "dialog.surface.hedging",
            json!(true),
            "set",
            "Recent reward dropping; enable hedging language.",
            0.48,
            None,
        ));
    }
    if uncertainty >= 0.7 {
        out.push(change(
            "guardrails.must_confirm.u_threshold",
            json!(0.38),
            "tighten",
            "Sustained high uncertainty; lower the confirmation threshold.",
            0.6,
            Some((0.3, 0.6)),
        ));
    }
    out
}

fn change_order(kind: &str) -> u8 {
    match kind {
        "tighten" => 0,
        "retune" => 1,
        "relax" => 2,
        _ => 3,
    }
}

/// Plan a bounded policy delta: learning-weight reinforcement plus config
/// change proposals from failing SLO checks and world-model signals.
pub fn plan_delta(state: &Value) -> Result<StageOutcome> {
    let checks: Vec<Value> = get_array(state, &["observability", "slo", "checks"])
        .cloned()
        .unwrap_or_default();
    let slo_score = get_f64(state, &["observability", "slo", "score"]);
    let has_metrics = get_array(state, &["observability", "telemetry", "metrics"])
        .map(|m| !m.is_empty())
        .unwrap_or(false)
        || get_path(state, &["executor", "results", "aggregate"]).is_some();
    if checks.is_empty() && slo_score.is_none() && !has_metrics {
        return Ok(StageOutcome::skip("no_signal"));
    }

    let learning = plan_learning(state);
    let summary = learning.get("summary").cloned().unwrap_or_else(|| json!({}));

    let mut changes = changes_from_checks(state, &checks);
    changes.extend(changes_from_world_model(state));

    // Blend change confidence with learning confidence.
    let conf_scale = summary
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5)
        .clamp(CONFIDENCE_MIN, 1.0);
    let avg_reward = summary.get("avg_reward").and_then(|r| r.as_f64()).unwrap_or(0.0);
    for ch in &mut changes {
        let base = ch.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.5);
        let mut adjusted = base * conf_scale.powf(CONFIDENCE_DECAY);
        if avg_reward < 0.3 && ch.get("change_type").and_then(|t| t.as_str()) == Some("relax") {
            adjusted *= 0.7;
        }
        ch["confidence"] = json!(round4(adjusted.clamp(CONFIDENCE_MIN, CONFIDENCE_MAX)));
    }

    changes.sort_by(|a, b| {
        let oa = change_order(a.get("change_type").and_then(|t| t.as_str()).unwrap_or("retune"));
        let ob = change_order(b.get("change_type").and_then(|t| t.as_str()).unwrap_or("retune"));
        oa.cmp(&ob).then_with(|| {
            b.get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.0)
                .partial_cmp(&a.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    changes.truncate(MAX_CHANGES_PER_TURN);

    let n_changes = changes.len();
    let updates = summary.get("updates").and_then(|u| u.as_i64()).unwrap_or(0);
    let adaptation_summary = json!({
        "updates": updates,
        "avg_reward": summary.get("avg_reward"),
        "confidence": summary.get("confidence"),
        "delta_norm": summary.get("delta_norm"),
        "learning_version": learning.get("version").and_then(|v| v.get("id")),
    });

    Ok(StageOutcome::ok_with(
        update(json!({
            "policy": {
                "delta": {
                    "changes": changes,
                    "guards": {
                        "max_changes": n_changes,
                        "ttl": {"seconds": DELTA_TTL_SECONDS},
                        "applies_safely": true,
                    },
                    "meta": {"created_at": iso_from_ms(now_ms(state))},
                },
                "learning": learning,
            },
            "adaptation": {"policy": adaptation_summary},
        })),
        json!({"reason": "ok", "counts": {"changes": n_changes, "learning_updates": updates}}),
    ))
}

// ---------------------------------------------------------------- apply plan

fn validate_change(ch: &Value) -> Result<(), &'static str> {
    let path = ch.get("path").and_then(|p| p.as_str()).unwrap_or("");
    if path.trim().is_empty() {
        return Err("invalid_path");
    }
    match ch.get("change_type").and_then(|t| t.as_str()) {
        Some("tighten") | Some("relax") | Some("retune") | Some("set") => {}
        _ => return Err("invalid_change_type"),
    }
    let Some(new_value) = ch.get("new_value") else {
        return Err("missing_value");
    };
    if let Some(bounds) = ch.get("bounds").filter(|b| b.is_object()) {
        if let Some(n) = new_value.as_f64() {
            if let Some(min) = bounds.get("min").and_then(|m| m.as_f64()) {
                if n < min {
                    return Err("out_of_bounds");
                }
            }
            if let Some(max) = bounds.get("max").and_then(|m| m.as_f64()) {
                if n > max {
                    return Err("out_of_bounds");
                }
            }
        }
    }
    Ok(())
}

/// Validate the proposed delta against the current config and produce set-ops
/// plus a preview diff. The TTL guard rejects stale deltas wholesale.
pub fn plan_apply(state: &Value) -> Result<StageOutcome> {
    let changes: Vec<Value> = get_array(state, &["policy", "delta", "changes"])
        .cloned()
        .unwrap_or_default();
    if changes.is_empty() {
        return Ok(StageOutcome::skip("no_delta"));
    }

    if let (Some(ttl), Some(created)) = (
        get_i64(state, &["policy", "delta", "guards", "ttl", "seconds"]),
        get_str(state, &["policy", "delta", "meta", "created_at"]).and_then(parse_iso_ms),
    ) {
        let age_s = (now_ms(state) - created) / 1000;
        if age_s > ttl {
            return Ok(StageOutcome::skip("ttl_expired"));
        }
    }

    let current = get_path(state, &["policy", "current"]).cloned().unwrap_or_else(|| json!({}));
    let budget = get_i64(state, &["policy", "delta", "guards", "max_changes"])
        .map(|b| b as usize)
        .unwrap_or(usize::MAX);

    let mut shadow = current.clone();
    let mut accepted: Vec<Value> = Vec::new();
    let mut rejected: Vec<Value> = Vec::new();
    let mut ops: Vec<Value> = Vec::new();
    let mut diff_set: Map<String, Value> = Map::new();
    let mut used = 0usize;

    for ch in &changes {
        if let Err(reason) = validate_change(ch) {
            let mut r = ch.clone();
            r["reason"] = json!(reason);
            rejected.push(r);
            continue;
        }
        if used >= budget {
            let mut r = ch.clone();
            r["reason"] = json!("over_max_changes");
            rejected.push(r);
            continue;
        }
        let path = ch["path"].as_str().expect("validated path");
        let new_value = ch["new_value"].clone();
        let old_value = get_dotted(&shadow, path).cloned().unwrap_or(Value::Null);
        if old_value == new_value {
            let mut a = ch.clone();
            a["note"] = json!("noop");
            accepted.push(a);
            continue;
        }
        ops.push(json!({"op": "set", "path": path, "value": new_value}));
        diff_set.insert(path.to_string(), json!({"old": old_value, "new": ch["new_value"]}));
        set_dotted(&mut shadow, path, ch["new_value"].clone());
        accepted.push(ch.clone());
        used += 1;
    }

    let changed_keys: Vec<&String> = diff_set.keys().collect();
    let n_acc = accepted.len();
    let n_rej = rejected.len();
    let n_ops = ops.len();
    Ok(StageOutcome::ok_with(
        update(json!({"policy": {"apply_plan": {
            "accepted": accepted,
            "rejected": rejected,
            "ops": ops,
            "preview": {"config": shadow, "diff": {"set": diff_set, "changed_keys": changed_keys}},
        }}})),
        json!({"reason": if n_ops > 0 {"ok"} else {"empty"},
               "counts": {"accepted": n_acc, "rejected": n_rej, "ops": n_ops}}),
    ))
}

// ---------------------------------------------------------------- stage

/// Version the apply plan into a staged config with rollback metadata. The
/// version id is deterministic in (parent id, ops, proposed config).
pub fn stage_apply(state: &Value) -> Result<StageOutcome> {
    let ops: Vec<Value> = get_array(state, &["policy", "apply_plan", "ops"])
        .cloned()
        .unwrap_or_default();
    if ops.is_empty() {
        return Ok(StageOutcome::skip("no_ops"));
    }

    let current = get_path(state, &["policy", "current"]).cloned().unwrap_or_else(|| json!({}));
    let proposed = get_path(state, &["policy", "apply_plan", "preview", "config"])
        .cloned()
        .unwrap_or_else(|| {
            let mut shadow = current.clone();
            for op in &ops {
                if let (Some(path), Some(value)) =
                    (op.get("path").and_then(|p| p.as_str()), op.get("value"))
                {
                    set_dotted(&mut shadow, path, value.clone());
                }
            }
            shadow
        });

    let parent_id = get_str(state, &["policy", "version", "current_id"]).map(str::to_string);
    let version_id = content_hash(&json!({
        "parent": &parent_id,
        "ops": &ops,
        "proposed_cfg": &proposed,
    }));
    let created_at = iso_from_ms(now_ms(state));
    let ns = config_namespace(state);

    let version_doc = json!({
        "id": version_id,
        "parent_id": parent_id,
        "created_at": created_at,
        "changes": ops.len(),
    });
    let keys = [
        format!("{ns}/versions/{version_id}"),
        format!("{ns}/configs/{version_id}"),
        format!("{ns}/pointers/current"),
    ];
    let storage_ops = json!([
        {"op": "put", "key": keys[0], "value": version_doc},
        {"op": "put", "key": keys[1], "value": proposed},
        {"op": "put", "key": keys[2], "value": {"version_id": version_id, "updated_at": created_at}},
    ]);

    let n_ops = ops.len();
    Ok(StageOutcome::ok_with(
        update(json!({"policy": {"apply_stage": {
            "version": {
                "id": version_id,
                "parent_id": version_doc["parent_id"],
                "created_at": created_at,
                "changes": n_ops,
            },
            "doc": {"config": proposed},
            "storage_apply": {"namespace": ns, "ops": storage_ops},
            "rollback_point": {
                "id": version_id,
                "parent_id": version_doc["parent_id"],
                "keys": [keys[2], keys[0], keys[1]],
            },
        }}})),
        json!({"reason": "ok", "counts": {"set_ops": n_ops}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::deep_merge;

    #[test]
    fn slo_breach_proposes_tightenings() {
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "observability": {
                "telemetry": {"metrics": [
                    {"name": "exec_avg_latency_ms", "value": 1800.0, "labels": {}},
                    {"name": "exec_total_cost", "value": 0.013, "labels": {}},
                ]},
                "slo": {"score": 0.61, "checks": [
                    {"name": "execution.latency_ms", "ok": false, "value": 1800.0, "threshold": 1500.0,
                     "weight": 0.22, "details": {"score": 0.3}},
                    {"name": "execution.cost_usd", "ok": false, "value": 0.013, "threshold": 0.01,
                     "weight": 0.18, "details": {"score": 0.4}},
                ]},
            },
            "world_model": {"uncertainty": {"score": 0.48, "recommendation": "answer_or_probe"}},
        });
        let out = plan_delta(&state).unwrap();
        let changes = out.update["policy"]["delta"]["changes"].as_array().unwrap();
        let find = |path: &str| {
            changes
                .iter()
                .find(|c| c["path"] == json!(path))
                .unwrap_or_else(|| panic!("missing change {path}"))
        };
        let timeout = find("executor.timeout_ms");
        assert_eq!(timeout["change_type"], json!("tighten"));
        let budget = find("budget.exec_total_cost_max");
        assert_eq!(budget["change_type"], json!("tighten"));
        for c in changes {
            let conf = c["confidence"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&conf));
        }
    }

    #[test]
    fn learning_bounds_hold_and_empty_trace_is_noop() {
        let trace: Vec<Value> = (0..12)
            .map(|_| json!({"reward": 1.0, "target": "direct_answer",
                            "actual": "direct_answer", "top_pred": "direct_answer"}))
            .collect();
        let mut weights = Map::new();
        for l in REPLY_LABELS {
            weights.insert(l.to_string(), json!(1.45));
        }
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "policy": {"learning": {"weights": weights}},
            "world_model": {"trace": {"error_history": trace}, "uncertainty": {"score": 0.1}},
            "observability": {"telemetry": {"metrics": [{"name": "x", "value": 1.0, "labels": {}}]}},
        });
        let out = plan_delta(&state).unwrap();
        let learned = out.update["policy"]["learning"]["weights"].as_object().unwrap();
        for (_, w) in learned {
            let w = w.as_f64().unwrap();
            assert!((WEIGHT_MIN..=WEIGHT_MAX).contains(&w), "weight {w} out of bounds");
        }
        let conf = out.update["policy"]["learning"]["summary"]["confidence"].as_f64().unwrap();
        assert!((CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&conf));

        // Empty trace: weights unchanged, no new version.
        let empty = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "policy": {"learning": {"weights": {"direct_answer": 0.7},
                                     "version": {"id": "v0"}}},
            "observability": {"telemetry": {"metrics": [{"name": "x", "value": 1.0, "labels": {}}]}},
        });
        let out = plan_delta(&empty).unwrap();
        let learning = &out.update["policy"]["learning"];
        assert_eq!(learning["weights"]["direct_answer"], json!(0.7));
        assert_eq!(learning["version"]["id"], json!("v0"));
        assert_eq!(learning["summary"]["updates"], json!(0));
    }

    #[test]
    fn apply_plan_validates_bounds_and_budget() {
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "policy": {
                "current": {"executor": {"timeout_ms": 30000}},
                "delta": {
                    "changes": [
                        {"path": "executor.timeout_ms", "new_value": 27000, "change_type": "tighten",
                         "confidence": 0.7, "bounds": {"min": 8000, "max": 60000}},
                        {"path": "executor.timeout_ms2", "new_value": 999_999, "change_type": "tighten",
                         "confidence": 0.7, "bounds": {"min": 8000, "max": 60000}},
                        {"path": "", "new_value": 1, "change_type": "set", "confidence": 0.5},
                    ],
                    "guards": {"max_changes": 5, "ttl": {"seconds": 3600}},
                    "meta": {"created_at": iso_from_ms(1_700_000_000_000)},
                },
            },
        });
        let out = plan_apply(&state).unwrap();
        let plan = &out.update["policy"]["apply_plan"];
        assert_eq!(plan["ops"].as_array().unwrap().len(), 1);
        assert_eq!(plan["rejected"].as_array().unwrap().len(), 2);
        assert_eq!(
            plan["preview"]["diff"]["changed_keys"],
            json!(["executor.timeout_ms"])
        );
        assert_eq!(plan["preview"]["config"]["executor"]["timeout_ms"], json!(27000));
    }

    #[test]
    fn expired_delta_is_skipped() {
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64 + 7_200_000},
            "policy": {"delta": {
                "changes": [{"path": "a.b", "new_value": 1, "change_type": "set", "confidence": 0.5}],
                "guards": {"ttl": {"seconds": 1800}},
                "meta": {"created_at": iso_from_ms(1_700_000_000_000)},
            }},
        });
        let out = plan_apply(&state).unwrap();
        assert_eq!(out.status, cognit_types::Status::Skip);
        assert_eq!(out.reason(), Some("ttl_expired"));
    }

    #[test]
    fn staged_version_is_deterministic_and_diffable() {
        let base = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-7"},
            "policy": {
                "current": {"executor": {"timeout_ms": 30000}},
                "version": {"current_id": "ver-previous"},
                "apply_plan": {
                    "ops": [{"op": "set", "path": "executor.timeout_ms", "value": 27000}],
                    "preview": {"config": {"executor": {"timeout_ms": 27000}}},
                },
            },
        });
        let a = stage_apply(&base).unwrap();
        let b = stage_apply(&base).unwrap();
        let stage_a = &a.update["policy"]["apply_stage"];
        assert_eq!(stage_a["version"]["id"], b.update["policy"]["apply_stage"]["version"]["id"]);
        assert_eq!(stage_a["version"]["parent_id"], json!("ver-previous"));
        let keys: Vec<&str> = stage_a["storage_apply"]["ops"]
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["key"].as_str().unwrap())
            .collect();
        assert!(keys[0].starts_with("config/cognit/t-7/versions/"));
        assert!(keys[2].ends_with("pointers/current"));
    }

    #[test]
    fn full_adaptation_chain_stages_a_version() {
        let mut state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-9"},
            "policy": {"current": {"executor": {"timeout_ms": 30000}}},
            "observability": {"slo": {"score": 0.5, "checks": [
                {"name": "execution.latency_ms", "ok": false, "value": 1800.0, "threshold": 1500.0,
                 "weight": 0.22, "details": {"score": 0.3}},
            ]}},
        });
        for stage in [plan_delta, plan_apply, stage_apply] {
            let out = stage(&state).unwrap();
            deep_merge(&mut state, Value::Object(out.update));
        }
        let stage = &state["policy"]["apply_stage"];
        assert!(stage["version"]["id"].as_str().unwrap().len() == 64);
        assert_eq!(stage["doc"]["config"]["executor"]["timeout_ms"], json!(27000));
    }
}
