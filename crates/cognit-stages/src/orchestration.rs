use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_path, get_str, truncate_chars, update,
};

use crate::common::store_namespace;

const MAX_EMIT_LEN: usize = 1200;
const MAX_EMITS: usize = 4;
const MAX_REQS: usize = 24;
const MAX_JOB_REQS: usize = 32;
const MAX_APPLY_OPS: usize = 5000;
const MAX_INDEX_ITEMS: usize = 2000;
const DEFAULT_TIMEOUT_MS: i64 = 30_000;
const MAX_DEADLINE_MS: i64 = 120_000;

// ---------------------------------------------------------------- actions

fn first_route<'a>(schedule: &'a Value, kind: &str) -> Option<&'a Value> {
    schedule
        .get("routes")?
        .as_array()?
        .iter()
        .find(|r| r.get("type").and_then(|t| t.as_str()) == Some(kind))
}

/// Map the scheduler's decision into the abstract action list: delay, emit,
/// execute, persist, noop.
pub fn orchestrate(state: &Value) -> Result<StageOutcome> {
    let Some(schedule) = get_path(state, &["runtime", "schedule"])
        .filter(|s| s.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_schedule"));
    };

    let mut actions: Vec<Value> = Vec::new();
    let mut reasons: Vec<String> = Vec::new();

    let delay_ms = schedule.get("delay_ms").and_then(|d| d.as_i64()).unwrap_or(0);
    if delay_ms > 0 {
        actions.push(json!({"type": "delay", "ms": delay_ms}));
    }

    let action = schedule.get("action").and_then(|a| a.as_str()).unwrap_or("");
    if action == "answer" || action == "confirm" {
        let text = first_route(schedule, action)
            .and_then(|r| r.get("text"))
            .and_then(|t| t.as_str())
            .or_else(|| get_str(state, &["dialog", "final", "text"]))
            .unwrap_or("");
        if text.is_empty() {
            reasons.push("emit_without_text".to_string());
        } else {
            actions.push(json!({
                "type": "emit",
                "move": action,
                "text": truncate_chars(text, MAX_EMIT_LEN),
            }));
        }
    }

    if action == "execute" {
        let route = first_route(schedule, "execute").cloned().unwrap_or_else(|| json!({}));
        let run: Vec<Value> = route
            .get("run")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter(|x| x.is_object()).take(MAX_REQS).cloned().collect())
            .unwrap_or_default();
        if run.is_empty() {
            reasons.push("execute_without_run".to_string());
        } else {
            actions.push(json!({
                "type": "execute",
                "requests": run,
                "limits": route.get("limits").cloned().unwrap_or_else(|| json!({
                    "timeout_ms": DEFAULT_TIMEOUT_MS, "max_inflight": 4,
                })),
                "defer": route.get("defer").cloned().unwrap_or_else(|| json!([])),
            }));
        }
    }

    let apply_ops = get_array(state, &["storage", "apply_optimized", "ops"])
        .filter(|a| !a.is_empty())
        .or_else(|| get_array(state, &["storage", "apply", "ops"]).filter(|a| !a.is_empty()));
    let index_items = get_array(state, &["index", "queue_optimized", "items"])
        .filter(|a| !a.is_empty())
        .or_else(|| get_array(state, &["index", "queue", "items"]).filter(|a| !a.is_empty()));
    if apply_ops.is_some() || index_items.is_some() {
        actions.push(json!({
            "type": "persist",
            "apply_ops": apply_ops.map(|a| a.iter().take(MAX_APPLY_OPS).collect::<Vec<_>>()).unwrap_or_default(),
            "index_items": index_items.map(|a| a.iter().take(MAX_INDEX_ITEMS).collect::<Vec<_>>()).unwrap_or_default(),
        }));
    }

    if actions.is_empty() {
        actions.push(json!({"type": "noop"}));
    }
    let stop = actions
        .iter()
        .any(|a| matches!(a.get("type").and_then(|t| t.as_str()), Some("emit") | Some("execute")));

    let n_actions = actions.len();
    Ok(StageOutcome::ok_with(
        update(json!({"engine": {"actions": actions, "stop": stop}})),
        json!({"reason": "ok", "counts": {"actions": n_actions}, "notes": reasons}),
    ))
}

// ---------------------------------------------------------------- envelope

/// Map abstract actions into the driver plan's four optional subsections:
/// transport outbound, skills batch, storage apply + index, timers.
pub fn envelope_actions(state: &Value) -> Result<StageOutcome> {
    let Some(actions) = get_array(state, &["engine", "actions"]).filter(|a| !a.is_empty()) else {
        return Ok(StageOutcome::skip("no_actions"));
    };

    let ns = get_str(state, &["storage", "apply", "namespace"])
        .map(str::to_string)
        .unwrap_or_else(|| store_namespace(state));

    let mut outbound: Vec<Value> = Vec::new();
    let mut skills: Option<Value> = None;
    let mut storage: Option<Value> = None;
    let mut timers: Vec<Value> = Vec::new();
    let (mut c_emit, mut c_exec, mut c_persist, mut c_delay) = (0usize, 0usize, 0usize, 0usize);

    for action in actions {
        match action.get("type").and_then(|t| t.as_str()) {
            Some("emit") => {
                if outbound.len() >= MAX_EMITS {
                    continue;
                }
                let mv = action.get("move").and_then(|m| m.as_str()).unwrap_or("answer");
                let text = action.get("text").and_then(|t| t.as_str()).unwrap_or("");
                if text.is_empty() {
                    continue;
                }
                let text = truncate_chars(text, MAX_EMIT_LEN);
                outbound.push(json!({
                    "role": "assistant",
                    "move": mv,
                    "text": text,
                    "id": content_hash(&json!({"move": mv, "text": text})),
                }));
                c_emit += 1;
            }
            Some("execute") => {
                let mut batch: Vec<Value> = action
                    .get("requests")
                    .and_then(|r| r.as_array())
                    .map(|r| r.iter().filter(|x| x.is_object()).take(MAX_REQS).cloned().collect())
                    .unwrap_or_default();
                if batch.is_empty() {
                    continue;
                }
                for req in &mut batch {
                    if req.get("req_id").and_then(|i| i.as_str()).is_none() {
                        req["req_id"] = json!(content_hash(req));
                    }
                }
                let limits = action.get("limits").cloned().unwrap_or_else(|| json!({}));
                let defer = action.get("defer").cloned().unwrap_or_else(|| json!([]));
                match &mut skills {
                    None => {
                        skills = Some(json!({
                            "batch": batch,
                            "limits": {
                                "timeout_ms": limits.get("timeout_ms").and_then(|t| t.as_i64()).unwrap_or(DEFAULT_TIMEOUT_MS),
                                "max_inflight": limits.get("max_inflight").and_then(|m| m.as_i64()).unwrap_or(4),
                            },
                            "defer": defer,
                        }));
                    }
                    Some(existing) => {
                        if let Some(arr) = existing.get_mut("batch").and_then(|b| b.as_array_mut()) {
                            arr.extend(batch);
                            arr.truncate(MAX_REQS);
                        }
                        if let (Some(dst), Some(src)) = (
                            existing.get_mut("defer").and_then(|d| d.as_array_mut()),
                            defer.as_array(),
                        ) {
                            dst.extend(src.iter().cloned());
                        }
                    }
                }
                c_exec += 1;
            }
            Some("persist") => {
                let apply_ops: Vec<Value> = action
                    .get("apply_ops")
                    .and_then(|a| a.as_array())
                    .map(|a| a.iter().take(MAX_APPLY_OPS).cloned().collect())
                    .unwrap_or_default();
                let index_items: Vec<Value> = action
                    .get("index_items")
                    .and_then(|a| a.as_array())
                    .map(|a| a.iter().take(MAX_INDEX_ITEMS).cloned().collect())
                    .unwrap_or_default();
                if apply_ops.is_empty() && index_items.is_empty() {
                    continue;
                }
                match &mut storage {
                    None => {
                        storage = Some(json!({
                            "apply": {"namespace": ns, "ops": apply_ops},
                            "index": {"queue": index_items},
                        }));
                    }
                    Some(existing) => {
                        if let Some(arr) = existing
                            .pointer_mut("/apply/ops")
                            .and_then(|o| o.as_array_mut())
                        {
                            arr.extend(apply_ops);
                            arr.truncate(MAX_APPLY_OPS);
                        }
                        if let Some(arr) = existing
                            .pointer_mut("/index/queue")
                            .and_then(|q| q.as_array_mut())
                        {
                            arr.extend(index_items);
                            arr.truncate(MAX_INDEX_ITEMS);
                        }
                    }
                }
                c_persist += 1;
            }
            Some("delay") => {
                let ms = action.get("ms").and_then(|m| m.as_i64()).unwrap_or(0);
                if ms > 0 {
                    timers.push(json!({"ms": ms, "reason": "throttle_or_backoff"}));
                    c_delay += 1;
                }
            }
            _ => {}
        }
    }

    // Every section is written, absent ones as null, so a fresh plan always
    // replaces the previous tick's sections under deep merge.
    let mut plan = json!({
        "transport": null, "skills": null, "storage": null, "timers": null,
    });
    if !outbound.is_empty() {
        plan["transport"] = json!({"outbound": outbound, "meta": {"channel": "default"}});
    }
    if let Some(skills) = skills {
        plan["skills"] = skills;
    }
    if let Some(storage) = storage {
        plan["storage"] = storage;
    }
    if !timers.is_empty() {
        plan["timers"] = json!(timers);
    }

    Ok(StageOutcome::ok_with(
        update(json!({"driver": {"plan": plan}})),
        json!({"reason": "ok", "counts": {
            "emit": c_emit, "execute": c_exec, "persist": c_persist, "delay": c_delay,
        }}),
    ))
}

// ---------------------------------------------------------------- jobs

fn deadline_ms(timeout_ms: i64, pad: i64) -> i64 {
    (timeout_ms + pad).clamp(2000, MAX_DEADLINE_MS)
}

fn job_id(idempotency_key: &str, kind: &str) -> String {
    content_hash(&json!({"k": idempotency_key, "t": kind}))
}

/// Compile the driver plan into concrete jobs: content-hashed `job_id` and
/// `idempotency_key`, and a `deadline_ms` from per-type base timeouts plus
/// padding.
pub fn build_jobs(state: &Value) -> Result<StageOutcome> {
    let Some(plan) = get_path(state, &["driver", "plan"]) else {
        return Ok(StageOutcome::skip("no_plan"));
    };
    let ns = store_namespace(state);

    let mut jobs: Vec<Value> = Vec::new();

    if let Some(outbound) = plan
        .pointer("/transport/outbound")
        .and_then(|o| o.as_array())
        .filter(|o| !o.is_empty())
    {
        let items: Vec<&Value> = outbound.iter().take(MAX_EMITS * 2).collect();
        let key = content_hash(&json!({"ns": &ns, "type": "emit", "items": &items}));
        jobs.push(json!({
            "type": "transport.emit",
            "job_id": job_id(&key, "emit"),
            "idempotency_key": key,
            "items": items,
            "deadline_ms": deadline_ms(8000, 1000),
        }));
    }

    if let Some(skills) = plan.get("skills").filter(|s| {
        s.get("batch").and_then(|b| b.as_array()).map(|b| !b.is_empty()).unwrap_or(false)
    }) {
        let batch: Vec<&Value> = skills["batch"].as_array().unwrap().iter().take(MAX_JOB_REQS).collect();
        let timeout = skills
            .pointer("/limits/timeout_ms")
            .and_then(|t| t.as_i64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let max_inflight = skills
            .pointer("/limits/max_inflight")
            .and_then(|m| m.as_i64())
            .unwrap_or(4);
        let limits = json!({"timeout_ms": timeout, "max_inflight": max_inflight});
        let key = content_hash(&json!({"ns": &ns, "type": "skills", "batch": &batch, "limits": &limits}));
        jobs.push(json!({
            "type": "skills.execute",
            "job_id": job_id(&key, "skills"),
            "idempotency_key": key,
            "batch": batch,
            "limits": limits,
            "defer": skills.get("defer").cloned().unwrap_or_else(|| json!([])),
            "deadline_ms": deadline_ms(timeout, 3000),
        }));
    }

    if let Some(storage) = plan.get("storage") {
        let apply_ns = storage
            .pointer("/apply/namespace")
            .and_then(|n| n.as_str())
            .unwrap_or(&ns)
            .to_string();
        let apply_ops: Vec<&Value> = storage
            .pointer("/apply/ops")
            .and_then(|o| o.as_array())
            .map(|o| o.iter().take(MAX_APPLY_OPS).collect())
            .unwrap_or_default();
        let index_queue: Vec<&Value> = storage
            .pointer("/index/queue")
            .and_then(|q| q.as_array())
            .map(|q| q.iter().take(MAX_INDEX_ITEMS).collect())
            .unwrap_or_default();
        if !apply_ops.is_empty() || !index_queue.is_empty() {
            let key = content_hash(&json!({"ns": &apply_ns, "apply_ops": &apply_ops, "idx": &index_queue}));
            jobs.push(json!({
                "type": "storage.apply_index",
                "job_id": job_id(&key, "storage"),
                "idempotency_key": key,
                "namespace": apply_ns,
                "apply_ops": apply_ops,
                "index_queue": index_queue,
                "deadline_ms": deadline_ms(10_000, 2000),
            }));
        }
    }

    // Retry jobs planned by the previous tick's reply pass run now. They
    // reuse their original idempotency keys, so the rebuilt job ids match
    // the ones the attempts history is keyed by.
    let retry_jobs: Vec<Value> = get_array(state, &["driver", "retry", "jobs"])
        .cloned()
        .unwrap_or_default();
    let retry_backoff = get_path(state, &["driver", "retry", "backoff_ms"])
        .and_then(|b| b.as_i64())
        .unwrap_or(0);
    let n_retries = retry_jobs.len();
    for retry in retry_jobs {
        let Some(kind) = retry.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let tag = match kind {
            "transport.emit" => "emit",
            "skills.execute" => "skills",
            "storage.apply_index" => "storage",
            "timer.sleep" => "timer",
            _ => continue,
        };
        let key = retry
            .get("idempotency_key")
            .and_then(|k| k.as_str())
            .unwrap_or("")
            .to_string();
        let mut job = retry;
        job["job_id"] = json!(job_id(&key, tag));
        jobs.push(job);
    }

    let mut timer_candidates: Vec<i64> = plan
        .get("timers")
        .and_then(|t| t.as_array())
        .map(|timers| {
            timers
                .iter()
                .filter_map(|t| t.get("ms").and_then(|m| m.as_i64()))
                .filter(|ms| *ms > 0)
                .collect()
        })
        .unwrap_or_default();
    if retry_backoff > 0 {
        timer_candidates.push(retry_backoff);
    }
    if let Some(ms) = timer_candidates.into_iter().min() {
        let key = content_hash(&json!({"ns": &ns, "sleep_ms": ms}));
        jobs.push(json!({
            "type": "timer.sleep",
            "job_id": job_id(&key, "timer"),
            "idempotency_key": key,
            "ms": ms,
            "deadline_ms": (ms + 2000).min(60_000),
        }));
    }

    let n_jobs = jobs.len();
    Ok(StageOutcome::ok_with(
        update(json!({"driver": {
            "jobs": jobs,
            // Consumed: the planned retries are now concrete jobs.
            "retry": {"jobs": [], "backoff_ms": 0},
        }})),
        json!({"reason": "ok", "counts": {"jobs": n_jobs, "retries": n_retries}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::deep_merge;

    fn exec_schedule_state() -> Value {
        json!({
            "session": {"thread_id": "t-1"},
            "runtime": {"schedule": {
                "action": "execute",
                "delay_ms": 180,
                "routes": [{
                    "type": "execute",
                    "run": [{"req_id": "r1", "skill_id": "skill.echo", "params": {"msg": "hi"},
                             "idempotency_key": "r1"}],
                    "defer": ["r2"],
                    "limits": {"timeout_ms": 28000, "max_inflight": 2},
                }],
            }},
            "storage": {"apply_optimized": {"ops": [{"op": "put", "key": "k/a", "value": {"x": 1}}]}},
            "index": {"queue_optimized": {"items": [{"type": "packz", "id": "u1", "ns": "store/cognit/t-1",
                                                      "text": "hello"}]}},
        })
    }

    #[test]
    fn orchestrates_delay_execute_persist() {
        let out = orchestrate(&exec_schedule_state()).unwrap();
        let actions = out.update["engine"]["actions"].as_array().unwrap();
        let kinds: Vec<&str> = actions.iter().map(|a| a["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["delay", "execute", "persist"]);
        assert_eq!(out.update["engine"]["stop"], json!(true));
    }

    #[test]
    fn answer_schedule_emits() {
        let state = json!({
            "runtime": {"schedule": {"action": "answer", "delay_ms": 0,
                                      "routes": [{"type": "answer", "text": "Done."}]}},
        });
        let out = orchestrate(&state).unwrap();
        let actions = out.update["engine"]["actions"].as_array().unwrap();
        assert_eq!(actions[0]["type"], json!("emit"));
        assert_eq!(actions[0]["text"], json!("Done."));
    }

    #[test]
    fn noop_schedule_produces_noop() {
        let state = json!({"runtime": {"schedule": {"action": "noop", "routes": []}}});
        let out = orchestrate(&state).unwrap();
        let actions = out.update["engine"]["actions"].as_array().unwrap();
        assert_eq!(actions, &vec![json!({"type": "noop"})]);
        assert_eq!(out.update["engine"]["stop"], json!(false));
    }

    fn pipeline_to_jobs(state: Value) -> Value {
        let mut state = state;
        for stage in [orchestrate, envelope_actions, build_jobs] {
            let out = stage(&state).unwrap();
            deep_merge(&mut state, Value::Object(out.update));
        }
        state
    }

    #[test]
    fn jobs_carry_ids_keys_and_deadlines() {
        let state = pipeline_to_jobs(exec_schedule_state());
        let jobs = state["driver"]["jobs"].as_array().unwrap();
        let kinds: Vec<&str> = jobs.iter().map(|j| j["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["skills.execute", "storage.apply_index", "timer.sleep"]);
        for job in jobs {
            assert_eq!(job["job_id"].as_str().unwrap().len(), 64);
            assert_eq!(job["idempotency_key"].as_str().unwrap().len(), 64);
            assert!(job["deadline_ms"].as_i64().unwrap() >= 2000);
        }
        // Skills deadline is timeout plus padding.
        let skills = &jobs[0];
        assert_eq!(skills["deadline_ms"], json!(31_000));
    }

    #[test]
    fn job_ids_are_deterministic() {
        let a = pipeline_to_jobs(exec_schedule_state());
        let b = pipeline_to_jobs(exec_schedule_state());
        assert_eq!(a["driver"]["jobs"], b["driver"]["jobs"]);
    }

    #[test]
    fn emit_becomes_transport_job() {
        let state = json!({
            "session": {"thread_id": "t-1"},
            "runtime": {"schedule": {"action": "answer", "delay_ms": 0,
                                      "routes": [{"type": "answer", "text": "hello out"}]}},
        });
        let state = pipeline_to_jobs(state);
        let jobs = state["driver"]["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["type"], json!("transport.emit"));
        let item = &jobs[0]["items"][0];
        assert_eq!(item["text"], json!("hello out"));
        assert_eq!(item["role"], json!("assistant"));
        assert_eq!(item["id"].as_str().unwrap().len(), 64);
    }
}
