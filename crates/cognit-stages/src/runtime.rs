use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{
    Move, StageOutcome, content_hash, get_array, get_f64, get_path, get_str, hash_bucket,
    truncate_chars, update,
};

use crate::common::{iso_from_ms, now_ms, thread_id};

const DEFAULT_INTROSPECTION_COOLDOWN_MS: i64 = 15_000;
const DEFAULT_REFLECTION_COOLDOWN_MS: i64 = 20_000;
const THROTTLE_LATENCY_CAP_MS: i64 = 1200;
const THROTTLE_INDEX_CAP_MS: i64 = 600;
const THROTTLE_TOTAL_CAP_MS: i64 = 1500;

// ---------------------------------------------------------------- activate

/// Recursive structural diff with added/changed/removed buckets; nested map
/// changes bubble up under a `nested` wrapper.
fn diff(old: &Value, new: &Value) -> Value {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut added = Map::new();
    let mut changed = Map::new();
    let mut removed: Vec<&String> = Vec::new();

    for (k, v) in new {
        if !old.contains_key(k) {
            added.insert(k.clone(), v.clone());
        }
    }
    for (k, ov) in old {
        match new.get(k) {
            None => removed.push(k),
            Some(nv) if ov.is_object() && nv.is_object() => {
                let sub = diff(ov, nv);
                let has_changes = ["added", "changed"]
                    .iter()
                    .any(|b| sub[*b].as_object().map(|m| !m.is_empty()).unwrap_or(false))
                    || sub["removed"].as_array().map(|a| !a.is_empty()).unwrap_or(false);
                if has_changes {
                    changed.insert(k.clone(), json!({"nested": sub}));
                }
            }
            Some(nv) if nv != ov => {
                changed.insert(k.clone(), json!({"old": ov, "new": nv}));
            }
            _ => {}
        }
    }
    json!({"added": added, "changed": changed, "removed": removed})
}

/// Activate the most recently staged policy version into `runtime.config`,
/// with a structural diff against the previous snapshot and a rollback token.
pub fn activate_config(state: &Value) -> Result<StageOutcome> {
    let Some(stage) = get_path(state, &["policy", "apply_stage"])
        .filter(|s| s.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_stage"));
    };

    let staged_cfg = stage
        .get("doc")
        .and_then(|d| d.get("config"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let version = stage.get("version").cloned().unwrap_or_else(|| json!({}));
    let prev = get_path(state, &["runtime", "config"])
        .or_else(|| get_path(state, &["policy", "current_runtime"]))
        .cloned()
        .unwrap_or_else(|| json!({}));

    let structural = diff(&prev, &staged_cfg);
    let version_id = version.get("id").cloned().unwrap_or(Value::Null);
    let parent_id = version.get("parent_id").cloned().unwrap_or(Value::Null);

    Ok(StageOutcome::ok(update(json!({"runtime": {
        "config": staged_cfg,
        "version": {
            "id": version_id,
            "parent_id": parent_id,
            "activated_at": iso_from_ms(now_ms(state)),
        },
        "diff": structural,
        "rollback_token": {
            "version_id": version_id,
            "parent_id": parent_id,
            "sig": content_hash(&json!({"rid": version_id, "parent": parent_id})),
        },
    }}))))
}

// ---------------------------------------------------------------- gatekeeper

fn metric_value(state: &Value, name: &str) -> f64 {
    get_array(state, &["observability", "telemetry", "metrics"])
        .and_then(|metrics| {
            metrics
                .iter()
                .rev()
                .find(|m| m.get("name").and_then(|n| n.as_str()) == Some(name))
        })
        .and_then(|m| m.get("value"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

/// Evaluate a feature flag: plain booleans pass through; rollout objects
/// bucket `(thread_id, salt)` deterministically and honor SLO/uncertainty
/// conditions.
fn eval_flag(flag: &Value, thread: &str, slo: f64, uncertainty: f64) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Object(cfg) => {
            if let Some(min) = cfg.get("when").and_then(|w| w.get("slo_score_min")).and_then(|v| v.as_f64()) {
                if slo < min {
                    return false;
                }
            }
            if let Some(max) = cfg
                .get("when")
                .and_then(|w| w.get("uncertainty_max"))
                .and_then(|v| v.as_f64())
            {
                if uncertainty > max {
                    return false;
                }
            }
            let rollout = cfg
                .get("rollout")
                .and_then(|r| r.as_i64())
                .unwrap_or(0)
                .clamp(0, 100) as u32;
            let salt = cfg.get("salt").and_then(|s| s.as_str()).unwrap_or("cognit");
            hash_bucket(&format!("{thread}|{salt}"), 100) < rollout
        }
        _ => false,
    }
}

/// Gate the tick from the activated config: confirmation requirement, SLO
/// execute-block, additive latency/index-queue throttling, execution limits,
/// and deterministic feature flags.
pub fn gatekeeper(state: &Value) -> Result<StageOutcome> {
    let Some(cfg) = get_path(state, &["runtime", "config"])
        .filter(|c| c.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_config"));
    };

    let slo_score = get_f64(state, &["observability", "slo", "score"]).unwrap_or(1.0);
    let uncertainty = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
    let thread = thread_id(state);
    let latency = metric_value(state, "exec_avg_latency_ms");
    let index_queue = metric_value(state, "index_queue_items");

    let must_confirm_u = cfg
        .pointer("/guardrails/must_confirm/u_threshold")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.4);
    let slo_block = cfg
        .pointer("/guardrails/block_execute_when/slo_below")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0); // zero disables
    let latency_soft = cfg
        .pointer("/guardrails/latency_soft_limit_ms")
        .and_then(|v| v.as_f64())
        .unwrap_or(1500.0);
    let index_soft = cfg
        .pointer("/guardrails/index_queue_soft_max")
        .and_then(|v| v.as_f64())
        .unwrap_or(1000.0);
    let timeout_ms = cfg
        .pointer("/executor/timeout_ms")
        .and_then(|v| v.as_i64())
        .unwrap_or(30_000);
    let max_inflight = cfg
        .pointer("/executor/parallelism/max_inflight")
        .and_then(|v| v.as_i64())
        .unwrap_or(4);

    let mut reasons: Vec<String> = Vec::new();
    let require_confirm = uncertainty >= must_confirm_u;
    let mut allow_execute = true;
    if slo_block > 0.0 && slo_score < slo_block {
        allow_execute = false;
        reasons.push(format!("block_execute: slo_score({slo_score}) < {slo_block}"));
    }

    // Additive throttling: half the latency overage plus a tenth of the
    // index-queue overage, each capped, totals capped.
    let mut throttle_ms: i64 = 0;
    if latency > latency_soft {
        throttle_ms = (((latency - latency_soft) * 0.5) as i64).min(THROTTLE_LATENCY_CAP_MS);
        reasons.push(format!("throttle: high_latency={latency}ms > {latency_soft}ms"));
    }
    if index_queue > index_soft {
        let extra = (((index_queue - index_soft) * 0.1) as i64).min(THROTTLE_INDEX_CAP_MS);
        throttle_ms = (throttle_ms + extra).min(THROTTLE_TOTAL_CAP_MS);
        reasons.push(format!("throttle: index_queue={index_queue} > {index_soft}"));
    }

    let mut features = Map::new();
    if let Some(flags) = cfg.get("features").and_then(|f| f.as_object()) {
        for (name, flag) in flags {
            features.insert(
                name.clone(),
                json!(eval_flag(flag, &thread, slo_score, uncertainty)),
            );
        }
    }

    Ok(StageOutcome::ok(update(json!({"runtime": {
        "gates": {
            "allow_execute": allow_execute,
            "allow_answer": true,
            "require_confirm": require_confirm,
            "throttle_ms": throttle_ms.max(0),
            "limits": {"timeout_ms": timeout_ms, "max_inflight": max_inflight},
            "features": features,
        },
        "reasons": reasons,
    }}))))
}

// ---------------------------------------------------------------- schedule

/// Select this tick's single action from the gates and the pending work:
/// confirm when required, sleep when blocked, batch executions up to
/// `max_inflight`, forward the dialog answer, otherwise noop.
pub fn schedule(state: &Value) -> Result<StageOutcome> {
    let Some(gates) = get_path(state, &["runtime", "gates"])
        .filter(|g| g.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_gates"));
    };

    let throttle_ms = gates.get("throttle_ms").and_then(|t| t.as_i64()).unwrap_or(0);
    let limits = gates.get("limits").cloned().unwrap_or_else(|| json!({}));
    let timeout_ms = limits.get("timeout_ms").and_then(|t| t.as_i64()).unwrap_or(30_000);
    let max_inflight = limits
        .get("max_inflight")
        .and_then(|m| m.as_i64())
        .unwrap_or(4)
        .max(0) as usize;
    let features = gates.get("features").cloned().unwrap_or_else(|| json!({}));

    // Requests that already produced a result (ok or failed) are done; the
    // retry planner owns re-dispatching failures.
    let completed: std::collections::HashSet<String> =
        get_array(state, &["executor", "results", "items"])
            .map(|items| {
                items
                    .iter()
                    .filter_map(|it| it.get("req_id").and_then(|r| r.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    let requests: Vec<Value> = get_array(state, &["executor", "requests"])
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|r| {
            r.get("req_id")
                .and_then(|i| i.as_str())
                .map(|id| !completed.contains(id))
                .unwrap_or(true)
        })
        .collect();
    let has_exec = !requests.is_empty();

    let final_move = get_str(state, &["dialog", "final", "move"]).unwrap_or("");
    let has_answer = matches!(
        Move::parse(final_move),
        Some(Move::Answer | Move::Ack | Move::Refuse)
    );
    let answer_text = get_str(state, &["dialog", "final", "text"]);

    let mut reasons: Vec<String> = get_array(state, &["runtime", "reasons"])
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    let require_confirm = gates.get("require_confirm").and_then(|b| b.as_bool()).unwrap_or(false);
    let allow_execute = gates.get("allow_execute").and_then(|b| b.as_bool()).unwrap_or(true);
    let allow_answer = gates.get("allow_answer").and_then(|b| b.as_bool()).unwrap_or(true);

    let action = if require_confirm && (has_exec || has_answer) {
        reasons.push("require_confirm".to_string());
        "confirm"
    } else if has_exec && !allow_execute {
        reasons.push("execute_blocked".to_string());
        "sleep"
    } else if has_answer && !allow_answer {
        reasons.push("answer_blocked".to_string());
        "sleep"
    } else if has_exec {
        "execute"
    } else if has_answer {
        "answer"
    } else {
        reasons.push("nothing_to_do".to_string());
        "noop"
    };

    let mut routes: Vec<Value> = Vec::new();
    let (mut run_n, mut defer_n) = (0usize, 0usize);
    match action {
        "confirm" => routes.push(json!({"type": "confirm", "reason": "require_confirm"})),
        "execute" => {
            let run: Vec<&Value> = requests.iter().take(max_inflight).collect();
            let defer: Vec<&str> = requests
                .iter()
                .skip(max_inflight)
                .filter_map(|r| r.get("req_id").and_then(|i| i.as_str()))
                .collect();
            run_n = run.len();
            defer_n = defer.len();
            routes.push(json!({
                "type": "execute",
                "run": run,
                "defer": defer,
                "limits": {"timeout_ms": timeout_ms, "max_inflight": max_inflight},
            }));
        }
        "answer" => {
            routes.push(json!({
                "type": "answer",
                "text": answer_text.map(|t| truncate_chars(t, 1200)),
            }));
        }
        _ => {}
    }

    let n_total = requests.len();
    Ok(StageOutcome::ok_with(
        update(json!({"runtime": {
            "schedule": {
                "action": action,
                "delay_ms": throttle_ms.max(0),
                "routes": routes,
                "features": features,
            },
            "reasons": reasons,
        }})),
        json!({"reason": "ok", "counts": {"requests_total": n_total, "run": run_n, "defer": defer_n}}),
    ))
}

// ---------------------------------------------------------------- initiative

fn reflection_text(state: &Value) -> Option<String> {
    let rules = get_array(state, &["concept_graph", "rules", "rules"])?;
    let rule = rules.last()?;
    let nodes = get_array(state, &["concept_graph", "nodes", "nodes"]);
    let key_of = |id: &Value| -> String {
        let id = id.as_str().unwrap_or("");
        nodes
            .and_then(|ns| {
                ns.iter()
                    .find(|n| n.get("id").and_then(|i| i.as_str()) == Some(id))
            })
            .and_then(|n| n.get("key").and_then(|k| k.as_str()))
            .unwrap_or(id)
            .to_string()
    };
    match rule.get("type").and_then(|t| t.as_str()) {
        Some("assoc") => Some(format!(
            "I noticed a new association between {} and {}. Should I keep it?",
            key_of(rule.get("u")?),
            key_of(rule.get("v")?)
        )),
        Some("synonym") => Some(format!(
            "I think {} and {} might be synonyms. Does that feel right?",
            key_of(rule.get("a")?),
            key_of(rule.get("b")?)
        )),
        Some("subsumes") => Some(format!(
            "It looks like {} may include {}. Should we store that link?",
            key_of(rule.get("parent")?),
            key_of(rule.get("child")?)
        )),
        _ => None,
    }
}

/// Fire due initiative items: a `say` claims the dialog final (when free), a
/// `run_skill` appends to the executor queue. Non-once items reschedule at
/// now + cooldown. Sustained high uncertainty enqueues an introspection
/// prompt and fresh concept rules a reflection prompt, each cooldown-gated.
pub fn initiative(state: &Value) -> Result<StageOutcome> {
    let now = now_ms(state);
    if now <= 0 {
        return Ok(StageOutcome::skip("no_clock"));
    }

    let mut queue: Vec<Value> = get_array(state, &["initiative", "queue"])
        .cloned()
        .unwrap_or_default();
    let mut cooldowns: Map<String, Value> = get_path(state, &["initiative", "cooldowns"])
        .and_then(|c| c.as_object())
        .cloned()
        .unwrap_or_default();

    let summary = get_path(state, &["observability", "telemetry", "summary"])
        .cloned()
        .unwrap_or_else(|| json!({}));

    // Autonomous introspection under sustained uncertainty.
    if summary
        .get("needs_introspection")
        .and_then(|b| b.as_bool())
        .unwrap_or(false)
    {
        let last = cooldowns
            .get("introspection_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let cooldown = summary
            .get("introspection_cooldown_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_INTROSPECTION_COOLDOWN_MS);
        if now - last >= cooldown {
            let uncertainty = summary.get("uncertainty").and_then(|u| u.as_f64()).unwrap_or(0.0);
            let text = if uncertainty >= 0.75 {
                "I'm not confident I understood that; could you give me more detail?"
            } else {
                "I need a bit more information before I can continue."
            };
            queue.push(json!({
                "type": "say", "when_ms": now, "payload": {"text": text},
                "once": true, "cooldown_ms": cooldown,
            }));
            cooldowns.insert("introspection_ms".to_string(), json!(now));
        }
    }

    // Reflection on newly extracted concept rules.
    if summary
        .get("concept_new_rules")
        .and_then(|n| n.as_i64())
        .unwrap_or(0)
        > 0
    {
        let last = cooldowns
            .get("reflection_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let cooldown = summary
            .get("reflection_cooldown_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_REFLECTION_COOLDOWN_MS);
        if now - last >= cooldown {
            if let Some(text) = reflection_text(state) {
                queue.push(json!({
                    "type": "say", "when_ms": now,
                    "payload": {"text": text, "move": "reflection"},
                    "once": true, "cooldown_ms": cooldown,
                }));
                cooldowns.insert("reflection_ms".to_string(), json!(now));
            }
        }
    }

    let mut dialog_out: Option<Value> = None;
    let mut dialog_busy = get_path(state, &["dialog", "final"])
        .map(|f| f.as_object().map(|o| !o.is_empty()).unwrap_or(false))
        .unwrap_or(false);
    let mut new_requests: Vec<Value> = Vec::new();
    let mut kept: Vec<Value> = Vec::new();
    let mut taken = 0usize;

    for mut item in queue {
        let when_ms = item.get("when_ms").and_then(|w| w.as_i64()).unwrap_or(0);
        let due = when_ms > 0 && when_ms <= now;
        if !due {
            kept.push(item);
            continue;
        }
        let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let once = item.get("once").and_then(|o| o.as_bool()).unwrap_or(true);
        let cooldown = item.get("cooldown_ms").and_then(|c| c.as_i64()).unwrap_or(0);

        let fired = match kind {
            "say" if !dialog_busy => {
                let text = item
                    .pointer("/payload/text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                if text.is_empty() {
                    false
                } else {
                    let mv = item
                        .pointer("/payload/move")
                        .and_then(|m| m.as_str())
                        .unwrap_or("answer");
                    dialog_out = Some(json!({"move": mv, "text": text, "origin": "initiative"}));
                    dialog_busy = true;
                    true
                }
            }
            "run_skill" => match item.pointer("/payload/req") {
                Some(req) if req.is_object() => {
                    new_requests.push(req.clone());
                    true
                }
                _ => false,
            },
            _ => false,
        };

        if fired {
            taken += 1;
            if !once && cooldown > 0 {
                item["when_ms"] = json!(now + cooldown);
                kept.push(item);
            }
        } else {
            // Blocked or malformed; keep the item for a later tick.
            kept.push(item);
        }
    }

    let remain = kept.len();
    let mut out = json!({
        "initiative": {
            "queue": kept,
            "stats": {"taken": taken, "remain": remain},
            "cooldowns": cooldowns,
        }
    });
    if let Some(dialog) = dialog_out {
        out["dialog"] = json!({"final": dialog, "meta": {"clears_previous": true}});
    }
    if !new_requests.is_empty() {
        let mut all: Vec<Value> = get_array(state, &["executor", "requests"])
            .cloned()
            .unwrap_or_default();
        all.extend(new_requests);
        out["executor"] = json!({"requests": all});
    }

    Ok(StageOutcome::ok_with(
        update(out),
        json!({"reason": "ok", "counts": {"taken": taken, "remain": remain}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_state() -> Value {
        json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-42"},
            "runtime": {"config": {
                "dialog": {"surface": {"max_len": 800}},
                "executor": {"timeout_ms": 30000, "parallelism": {"max_inflight": 2}},
            }},
            "policy": {"apply_stage": {
                "version": {"id": "ver-abc", "parent_id": "ver-prev"},
                "doc": {"config": {
                    "dialog": {"surface": {"max_len": 720}},
                    "executor": {"timeout_ms": 27000, "parallelism": {"max_inflight": 2}},
                    "guardrails": {"must_confirm": {"u_threshold": 0.35}},
                }},
            }},
        })
    }

    #[test]
    fn activation_diffs_against_previous_config() {
        let out = activate_config(&staged_state()).unwrap();
        let rt = &out.update["runtime"];
        assert_eq!(rt["config"]["executor"]["timeout_ms"], json!(27000));
        assert_eq!(rt["version"]["id"], json!("ver-abc"));
        let changed = rt["diff"]["changed"].as_object().unwrap();
        assert!(changed.contains_key("dialog"));
        assert!(changed.contains_key("executor"));
        let added = rt["diff"]["added"].as_object().unwrap();
        assert!(added.contains_key("guardrails"));
    }

    fn gate_state(latency: f64, index_q: f64, uncertainty: f64, slo: f64) -> Value {
        json!({
            "session": {"thread_id": "t-42"},
            "runtime": {"config": {
                "guardrails": {
                    "must_confirm": {"u_threshold": 0.4},
                    "block_execute_when": {"slo_below": 0.35},
                    "latency_soft_limit_ms": 1500,
                    "index_queue_soft_max": 1000,
                },
                "executor": {"timeout_ms": 28000, "parallelism": {"max_inflight": 3}},
                "features": {
                    "fast_path": {"rollout": 50, "salt": "v1", "when": {"slo_score_min": 0.5}},
                    "always_on": true,
                },
            }},
            "observability": {
                "slo": {"score": slo},
                "telemetry": {"metrics": [
                    {"name": "exec_avg_latency_ms", "value": latency, "labels": {}},
                    {"name": "index_queue_items", "value": index_q, "labels": {}},
                ]},
            },
            "world_model": {"uncertainty": {"score": uncertainty}},
        })
    }

    #[test]
    fn throttle_is_half_latency_overage() {
        let out = gatekeeper(&gate_state(1900.0, 0.0, 0.1, 0.9)).unwrap();
        let gates = &out.update["runtime"]["gates"];
        // Overage of 400ms contributes 200ms.
        assert_eq!(gates["throttle_ms"], json!(200));
        assert_eq!(gates["require_confirm"], json!(false));
    }

    #[test]
    fn index_overage_adds_and_caps() {
        let out = gatekeeper(&gate_state(1900.0, 1200.0, 0.1, 0.9)).unwrap();
        let gates = &out.update["runtime"]["gates"];
        // 200 from latency plus 20 from 200 queued items over the soft max.
        assert_eq!(gates["throttle_ms"], json!(220));

        let out = gatekeeper(&gate_state(10_000.0, 50_000.0, 0.1, 0.9)).unwrap();
        let gates = &out.update["runtime"]["gates"];
        assert_eq!(gates["throttle_ms"], json!(THROTTLE_TOTAL_CAP_MS));
    }

    #[test]
    fn low_slo_blocks_execution() {
        let out = gatekeeper(&gate_state(100.0, 0.0, 0.1, 0.2)).unwrap();
        let gates = &out.update["runtime"]["gates"];
        assert_eq!(gates["allow_execute"], json!(false));
        assert_eq!(gates["allow_answer"], json!(true));
    }

    #[test]
    fn uncertainty_over_threshold_requires_confirm() {
        let out = gatekeeper(&gate_state(100.0, 0.0, 0.5, 0.9)).unwrap();
        assert_eq!(out.update["runtime"]["gates"]["require_confirm"], json!(true));
    }

    #[test]
    fn rollout_flags_are_deterministic_per_thread() {
        let a = gatekeeper(&gate_state(100.0, 0.0, 0.1, 0.9)).unwrap();
        let b = gatekeeper(&gate_state(100.0, 0.0, 0.1, 0.9)).unwrap();
        assert_eq!(
            a.update["runtime"]["gates"]["features"]["fast_path"],
            b.update["runtime"]["gates"]["features"]["fast_path"]
        );
        assert_eq!(a.update["runtime"]["gates"]["features"]["always_on"], json!(true));
        // Conditional gate: low SLO turns the rollout flag off.
        let c = gatekeeper(&gate_state(100.0, 0.0, 0.1, 0.3)).unwrap();
        assert_eq!(c.update["runtime"]["gates"]["features"]["fast_path"], json!(false));
    }

    #[test]
    fn scheduler_batches_up_to_max_inflight() {
        let state = json!({
            "runtime": {"gates": {
                "allow_execute": true, "allow_answer": true, "require_confirm": false,
                "throttle_ms": 250, "limits": {"timeout_ms": 28000, "max_inflight": 2},
                "features": {},
            }},
            "executor": {"requests": [
                {"req_id": "r1", "skill_id": "s", "params": {}},
                {"req_id": "r2", "skill_id": "s", "params": {}},
                {"req_id": "r3", "skill_id": "s", "params": {}},
            ]},
        });
        let out = schedule(&state).unwrap();
        let sched = &out.update["runtime"]["schedule"];
        assert_eq!(sched["action"], json!("execute"));
        assert_eq!(sched["delay_ms"], json!(250));
        let route = &sched["routes"][0];
        assert_eq!(route["run"].as_array().unwrap().len(), 2);
        assert_eq!(route["defer"], json!(["r3"]));
    }

    #[test]
    fn confirm_gate_preempts_execution() {
        let state = json!({
            "runtime": {"gates": {"allow_execute": true, "allow_answer": true,
                                   "require_confirm": true, "throttle_ms": 0,
                                   "limits": {"timeout_ms": 30000, "max_inflight": 4}}},
            "executor": {"requests": [{"req_id": "r1", "skill_id": "s", "params": {}}]},
        });
        let out = schedule(&state).unwrap();
        let sched = &out.update["runtime"]["schedule"];
        assert_eq!(sched["action"], json!("confirm"));
        assert_eq!(sched["routes"][0]["type"], json!("confirm"));
    }

    #[test]
    fn blocked_execution_sleeps() {
        let state = json!({
            "runtime": {"gates": {"allow_execute": false, "allow_answer": true,
                                   "require_confirm": false, "throttle_ms": 100,
                                   "limits": {"timeout_ms": 30000, "max_inflight": 4}}},
            "executor": {"requests": [{"req_id": "r1", "skill_id": "s", "params": {}}]},
        });
        let out = schedule(&state).unwrap();
        assert_eq!(out.update["runtime"]["schedule"]["action"], json!("sleep"));
        assert!(out.update["runtime"]["schedule"]["routes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn due_say_claims_dialog_and_leaves_queue() {
        let state = json!({
            "clock": {"now_ms": 1000},
            "initiative": {"queue": [
                {"id": "i1", "type": "say", "when_ms": 1000, "payload": {"text": "hello"}, "once": true},
            ]},
        });
        let out = initiative(&state).unwrap();
        assert_eq!(
            out.update["dialog"]["final"],
            json!({"move": "answer", "text": "hello", "origin": "initiative"})
        );
        assert!(out.update["initiative"]["queue"].as_array().unwrap().is_empty());
    }

    #[test]
    fn recurring_items_respect_cooldown() {
        let state = json!({
            "clock": {"now_ms": 5000},
            "initiative": {"queue": [
                {"id": "i1", "type": "say", "when_ms": 4000, "payload": {"text": "ping"},
                 "once": false, "cooldown_ms": 3000},
            ]},
        });
        let out = initiative(&state).unwrap();
        let queue = out.update["initiative"]["queue"].as_array().unwrap();
        assert_eq!(queue.len(), 1);
        // Rescheduled at now + cooldown, so it cannot refire before then.
        assert_eq!(queue[0]["when_ms"], json!(8000));
    }

    #[test]
    fn busy_dialog_defers_say_items() {
        let state = json!({
            "clock": {"now_ms": 1000},
            "dialog": {"final": {"move": "answer", "text": "already here"}},
            "initiative": {"queue": [
                {"id": "i1", "type": "say", "when_ms": 900, "payload": {"text": "later"}, "once": true},
            ]},
        });
        let out = initiative(&state).unwrap();
        assert!(out.update.get("dialog").is_none());
        assert_eq!(out.update["initiative"]["queue"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn run_skill_items_append_requests() {
        let state = json!({
            "clock": {"now_ms": 1000},
            "executor": {"requests": [{"req_id": "r0", "skill_id": "s", "params": {}}]},
            "initiative": {"queue": [
                {"id": "i1", "type": "run_skill", "when_ms": 500,
                 "payload": {"req": {"req_id": "r9", "skill_id": "skill.echo", "params": {}}},
                 "once": true},
            ]},
        });
        let out = initiative(&state).unwrap();
        let reqs = out.update["executor"]["requests"].as_array().unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1]["req_id"], json!("r9"));
    }

    #[test]
    fn high_uncertainty_enqueues_introspection_once_per_cooldown() {
        let state = json!({
            "clock": {"now_ms": 100_000},
            "observability": {"telemetry": {"summary": {
                "uncertainty": 0.8, "needs_introspection": true, "concept_new_rules": 0,
            }}},
        });
        let out = initiative(&state).unwrap();
        assert_eq!(out.update["dialog"]["final"]["origin"], json!("initiative"));
        assert_eq!(
            out.update["initiative"]["cooldowns"]["introspection_ms"],
            json!(100_000)
        );

        // Within the cooldown window nothing new fires.
        let mut state2 = state.clone();
        state2["clock"]["now_ms"] = json!(105_000);
        state2["initiative"] = out.update["initiative"].clone();
        let out2 = initiative(&state2).unwrap();
        assert!(out2.update.get("dialog").is_none());
    }
}
