use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{
    StageOutcome, get_array, get_path, get_str, hash_bucket, round2, truncate_chars, update,
};

use crate::common::store_namespace;

const MAX_EMIT: usize = 8;
const MAX_REQS: usize = 32;
const MAX_APPLY: usize = 6000;
const MAX_INDEX: usize = 3000;
const MAX_TEXT: usize = 1200;
const MAX_BACKOFF_MS: i64 = 120_000;

// ---------------------------------------------------------------- frames

fn endpoint_for(state: &Value, skill_id: &str) -> String {
    get_str(state, &["endpoints", "skills", skill_id, "endpoint"])
        .or_else(|| get_str(state, &["endpoints", "skills", "default", "endpoint"]))
        .unwrap_or("skills://local")
        .to_string()
}

/// Translate jobs into the I/O-neutral frames drivers consume. Frames carry
/// `deadline_ms` and `idempotency_key` for driver-side deduplication.
pub fn build_frames(state: &Value) -> Result<StageOutcome> {
    // An empty job list still merges an empty frame list, so stale frames
    // from the previous tick never redispatch.
    let Some(jobs) = get_array(state, &["driver", "jobs"]) else {
        return Ok(StageOutcome::skip("no_jobs"));
    };
    if jobs.is_empty() {
        return Ok(StageOutcome::ok_with(
            update(json!({"driver": {"protocol": {"frames": []}}})),
            json!({"reason": "ok", "counts": {"frames": 0}}),
        ));
    }
    let channel = get_str(state, &["endpoints", "transport", "channel"]).unwrap_or("default");

    let mut frames: Vec<Value> = Vec::new();
    for job in jobs {
        match job.get("type").and_then(|t| t.as_str()) {
            Some("transport.emit") => {
                let mut items: Vec<Value> = job
                    .get("items")
                    .and_then(|i| i.as_array())
                    .map(|i| i.iter().filter(|m| m.is_object()).take(MAX_EMIT).cloned().collect())
                    .unwrap_or_default();
                if items.is_empty() {
                    continue;
                }
                for m in &mut items {
                    if let Some(text) = m.get("text").and_then(|t| t.as_str()) {
                        let clipped = truncate_chars(text, MAX_TEXT);
                        m["text"] = json!(clipped);
                    }
                }
                frames.push(json!({
                    "type": "transport",
                    "channel": channel,
                    "messages": items,
                    "deadline_ms": job.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(8000),
                    "idempotency_key": job.get("idempotency_key"),
                    "meta": {"job_id": job.get("job_id")},
                }));
            }
            Some("skills.execute") => {
                let batch: Vec<&Value> = job
                    .get("batch")
                    .and_then(|b| b.as_array())
                    .map(|b| b.iter().filter(|r| r.is_object()).take(MAX_REQS).collect())
                    .unwrap_or_default();
                if batch.is_empty() {
                    continue;
                }
                let timeout = job
                    .pointer("/limits/timeout_ms")
                    .and_then(|t| t.as_i64())
                    .unwrap_or(30_000);
                let calls: Vec<Value> = batch
                    .iter()
                    .map(|r| {
                        let skill_id = r.get("skill_id").and_then(|s| s.as_str()).unwrap_or("");
                        json!({
                            "req_id": r.get("req_id"),
                            "skill_id": skill_id,
                            "endpoint": endpoint_for(state, skill_id),
                            "params": r.get("params").cloned().unwrap_or_else(|| json!({})),
                            "timeout_ms": timeout,
                            "idempotency_key": r.get("idempotency_key"),
                        })
                    })
                    .collect();
                frames.push(json!({
                    "type": "skills",
                    "calls": calls,
                    "limits": {
                        "timeout_ms": timeout,
                        "max_inflight": job.pointer("/limits/max_inflight").and_then(|m| m.as_i64()).unwrap_or(4),
                    },
                    "defer": job.get("defer").cloned().unwrap_or_else(|| json!([])),
                    "deadline_ms": job.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(35_000),
                    "idempotency_key": job.get("idempotency_key"),
                    "meta": {"job_id": job.get("job_id")},
                }));
            }
            Some("storage.apply_index") => {
                let apply: Vec<&Value> = job
                    .get("apply_ops")
                    .and_then(|a| a.as_array())
                    .map(|a| a.iter().take(MAX_APPLY).collect())
                    .unwrap_or_default();
                let index: Vec<&Value> = job
                    .get("index_queue")
                    .and_then(|q| q.as_array())
                    .map(|q| q.iter().take(MAX_INDEX).collect())
                    .unwrap_or_default();
                if apply.is_empty() && index.is_empty() {
                    continue;
                }
                frames.push(json!({
                    "type": "storage",
                    "namespace": job.get("namespace").and_then(|n| n.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| store_namespace(state)),
                    "apply": apply,
                    "index": index,
                    "deadline_ms": job.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(12_000),
                    "idempotency_key": job.get("idempotency_key"),
                    "meta": {"job_id": job.get("job_id")},
                }));
            }
            Some("timer.sleep") => {
                let ms = job.get("ms").and_then(|m| m.as_i64()).unwrap_or(0);
                if ms <= 0 {
                    continue;
                }
                frames.push(json!({
                    "type": "timer",
                    "sleep_ms": ms,
                    "deadline_ms": job.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(ms + 2000),
                    "idempotency_key": job.get("idempotency_key"),
                    "meta": {"job_id": job.get("job_id")},
                }));
            }
            _ => {}
        }
    }

    let n_frames = frames.len();
    Ok(StageOutcome::ok_with(
        update(json!({"driver": {"protocol": {"frames": frames}}})),
        json!({"reason": "ok", "counts": {"frames": n_frames}}),
    ))
}

// ---------------------------------------------------------------- replies

fn norm_skills(reply: &Value) -> Value {
    let calls = reply
        .get("calls")
        .or_else(|| reply.get("results"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut items: Vec<Value> = Vec::new();
    let mut total_cost = 0.0;
    let mut lat_sum = 0.0;
    let (mut ok_n, mut err_n) = (0usize, 0usize);

    for call in &calls {
        if !call.is_object() {
            continue;
        }
        let ok = call.get("ok").and_then(|b| b.as_bool()).unwrap_or(true);
        let data = call.get("data").filter(|d| d.is_object() || d.is_array());
        let kind = call
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or(if data.is_some() { "json" } else { "text" });
        let text = call.get("text").and_then(|t| t.as_str()).unwrap_or("");
        let usage = call.get("usage").cloned().unwrap_or_else(|| json!({}));
        let latency = call
            .get("latency_ms")
            .or_else(|| call.get("duration_ms"))
            .and_then(|l| l.as_f64())
            .unwrap_or(0.0);
        let cost = usage.get("cost").and_then(|c| c.as_f64()).unwrap_or(0.0);

        items.push(json!({
            "ok": ok,
            "kind": kind,
            "text": truncate_chars(text, MAX_TEXT),
            "data": data,
            "attachments": call.get("attachments").cloned().unwrap_or_else(|| json!([])),
            "usage": usage,
            "duration_ms": latency as i64,
            "score": call.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
            "req_id": call.get("req_id"),
        }));
        total_cost += cost;
        lat_sum += latency;
        if ok {
            ok_n += 1;
        } else {
            err_n += 1;
        }
    }

    let count = items.len();
    let best = items
        .iter()
        .filter(|it| it["ok"].as_bool().unwrap_or(false))
        .max_by(|a, b| {
            a["score"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&b["score"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .or_else(|| items.first())
        .cloned()
        .unwrap_or_else(|| json!({}));

    json!({"executor": {"results": {
        "items": items,
        "best": best,
        "aggregate": {
            "count": count,
            "ok": ok_n,
            "errors": err_n,
            "avg_latency_ms": round2(lat_sum / count.max(1) as f64),
            "total_cost": total_cost,
        },
    }}})
}

/// Flatten driver replies into the core's normalized sub-trees: executor
/// results, transport delivery, storage apply/index results, timer sleep.
pub fn normalize_replies(state: &Value) -> Result<StageOutcome> {
    let Some(replies) = get_array(state, &["driver", "replies"]).filter(|r| !r.is_empty()) else {
        return Ok(StageOutcome::skip("no_replies"));
    };

    let mut out = Map::new();
    for reply in replies {
        match reply.get("type").and_then(|t| t.as_str()) {
            Some("transport") => {
                let delivered: Vec<&Value> = reply
                    .get("messages")
                    .or_else(|| reply.pointer("/payload/messages"))
                    .and_then(|m| m.as_array())
                    .map(|m| m.iter().filter(|x| x.is_object()).collect())
                    .unwrap_or_default();
                let ids: Vec<&str> = delivered
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                    .collect();
                out.insert(
                    "transport".to_string(),
                    json!({"outbound": {
                        "delivered": delivered.len(),
                        "ids": ids,
                        "channel": reply.get("channel").and_then(|c| c.as_str()).unwrap_or("default"),
                        "ok": reply.get("ok").and_then(|b| b.as_bool()).unwrap_or(true),
                    }}),
                );
            }
            Some("skills") => {
                let normalized = norm_skills(reply);
                if let Some(executor) = normalized.get("executor") {
                    out.insert("executor".to_string(), executor.clone());
                }
            }
            Some("storage") => {
                let applied = reply
                    .pointer("/apply/ops")
                    .or_else(|| reply.get("apply_ops"))
                    .and_then(|o| o.as_array())
                    .map(|o| o.len())
                    .unwrap_or(0);
                let indexed = reply
                    .pointer("/index/queue")
                    .or_else(|| reply.get("index_queue"))
                    .and_then(|q| q.as_array())
                    .map(|q| q.len())
                    .unwrap_or(0);
                let ok = reply.get("ok").and_then(|b| b.as_bool()).unwrap_or(true);
                let apply_ok = reply
                    .pointer("/apply/ok")
                    .and_then(|b| b.as_bool())
                    .unwrap_or(ok);
                let index_ok = reply
                    .pointer("/index/ok")
                    .and_then(|b| b.as_bool())
                    .unwrap_or(ok);
                out.insert(
                    "storage".to_string(),
                    json!({
                        "apply_result": {"ok": apply_ok, "ops": applied},
                        "index_result": {"ok": index_ok, "items": indexed},
                    }),
                );
            }
            Some("timer") => {
                out.insert(
                    "timers".to_string(),
                    json!({"sleep": {
                        "ms": reply.get("sleep_ms").and_then(|m| m.as_i64()).unwrap_or(0),
                        "ok": reply.get("ok").and_then(|b| b.as_bool()).unwrap_or(true),
                    }}),
                );
            }
            _ => {}
        }
    }

    Ok(StageOutcome::ok(out))
}

// ---------------------------------------------------------------- retry

struct RetryPolicy {
    max_attempts: i64,
    backoff_ms: i64,
    factor: f64,
    jitter_ms: i64,
}

fn policy_for(state: &Value, subsystem: &str) -> RetryPolicy {
    let defaults = match subsystem {
        "skills" => RetryPolicy { max_attempts: 3, backoff_ms: 400, factor: 1.7, jitter_ms: 120 },
        "transport" => RetryPolicy { max_attempts: 2, backoff_ms: 200, factor: 1.5, jitter_ms: 80 },
        "storage" => RetryPolicy { max_attempts: 2, backoff_ms: 300, factor: 1.6, jitter_ms: 100 },
        _ => RetryPolicy { max_attempts: 0, backoff_ms: 0, factor: 1.0, jitter_ms: 0 },
    };
    let Some(cfg) = get_path(state, &["policy", "retry", subsystem]) else {
        return defaults;
    };
    RetryPolicy {
        max_attempts: cfg
            .get("max_attempts")
            .and_then(|v| v.as_i64())
            .unwrap_or(defaults.max_attempts),
        backoff_ms: cfg
            .get("backoff_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(defaults.backoff_ms),
        factor: cfg.get("factor").and_then(|v| v.as_f64()).unwrap_or(defaults.factor),
        jitter_ms: cfg
            .get("jitter_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(defaults.jitter_ms),
    }
}

/// Exponential backoff with deterministic jitter seeded from the job id;
/// monotone in attempts and capped.
fn next_backoff(policy: &RetryPolicy, attempts_done: i64, salt: &str) -> i64 {
    let raw = policy.backoff_ms as f64 * policy.factor.powi(attempts_done.max(0) as i32);
    let jitter = if policy.jitter_ms > 0 {
        hash_bucket(salt, policy.jitter_ms.max(1) as u32) as i64
    } else {
        0
    };
    ((raw as i64) + jitter).clamp(0, MAX_BACKOFF_MS)
}

fn last_job<'a>(jobs: &'a [Value], kind: &str) -> Option<&'a Value> {
    jobs.iter()
        .rev()
        .find(|j| j.get("type").and_then(|t| t.as_str()) == Some(kind))
}

/// Plan next-tick retries from the normalized replies: only the failed units
/// of each subsystem, within the per-subsystem attempt budget, reusing the
/// original idempotency keys.
pub fn plan_retry(state: &Value) -> Result<StageOutcome> {
    let jobs: Vec<Value> = get_array(state, &["driver", "jobs"]).cloned().unwrap_or_default();
    if jobs.is_empty() {
        return Ok(StageOutcome::skip("nothing_to_retry"));
    }

    let attempts: Map<String, Value> = get_path(state, &["driver", "history", "attempts"])
        .and_then(|a| a.as_object())
        .cloned()
        .unwrap_or_default();
    let attempts_of = |job_id: &str| attempts.get(job_id).and_then(|v| v.as_i64()).unwrap_or(0);

    let mut retry_jobs: Vec<Value> = Vec::new();
    let mut backoffs: Vec<i64> = Vec::new();
    let mut attempts_next = attempts.clone();
    let mut bump = |attempts_next: &mut Map<String, Value>, job_id: &str| {
        let next = attempts_of(job_id) + 1;
        attempts_next.insert(job_id.to_string(), json!(next));
    };

    // Skills: retry only the failed req_ids from the last skills job.
    let failed_reqs: Vec<&str> = get_array(state, &["executor", "results", "items"])
        .map(|items| {
            items
                .iter()
                .filter(|it| !it.get("ok").and_then(|b| b.as_bool()).unwrap_or(true))
                .filter_map(|it| it.get("req_id").and_then(|r| r.as_str()))
                .collect()
        })
        .unwrap_or_default();
    if !failed_reqs.is_empty() {
        if let Some(last) = last_job(&jobs, "skills.execute") {
            let job_id = last.get("job_id").and_then(|i| i.as_str()).unwrap_or("skills");
            let policy = policy_for(state, "skills");
            let done = attempts_of(job_id);
            if done < policy.max_attempts {
                let to_retry: Vec<&Value> = last
                    .get("batch")
                    .and_then(|b| b.as_array())
                    .map(|b| {
                        b.iter()
                            .filter(|r| {
                                r.get("req_id")
                                    .and_then(|i| i.as_str())
                                    .map(|id| failed_reqs.contains(&id))
                                    .unwrap_or(false)
                            })
                            .take(MAX_REQS)
                            .collect()
                    })
                    .unwrap_or_default();
                if !to_retry.is_empty() {
                    retry_jobs.push(json!({
                        "type": "skills.execute",
                        "batch": to_retry,
                        "limits": last.get("limits").cloned().unwrap_or_else(|| json!({})),
                        "defer": last.get("defer").cloned().unwrap_or_else(|| json!([])),
                        "idempotency_key": last.get("idempotency_key"),
                        "deadline_ms": last.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(35_000),
                    }));
                    backoffs.push(next_backoff(&policy, done, job_id));
                    bump(&mut attempts_next, job_id);
                }
            }
        }
    }

    // Transport: the batch is the retry unit.
    let transport_failed = !get_path(state, &["transport", "outbound", "ok"])
        .and_then(|b| b.as_bool())
        .unwrap_or(true);
    if transport_failed {
        if let Some(last) = last_job(&jobs, "transport.emit") {
            let job_id = last.get("job_id").and_then(|i| i.as_str()).unwrap_or("transport");
            let policy = policy_for(state, "transport");
            let done = attempts_of(job_id);
            if done < policy.max_attempts {
                if let Some(items) = last.get("items").and_then(|i| i.as_array()).filter(|i| !i.is_empty()) {
                    retry_jobs.push(json!({
                        "type": "transport.emit",
                        "items": items.iter().take(MAX_EMIT).collect::<Vec<_>>(),
                        "idempotency_key": last.get("idempotency_key"),
                        "deadline_ms": last.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(8000),
                    }));
                    backoffs.push(next_backoff(&policy, done, job_id));
                    bump(&mut attempts_next, job_id);
                }
            }
        }
    }

    // Storage: retry only the failed half (apply vs index).
    let apply_failed = !get_path(state, &["storage", "apply_result", "ok"])
        .and_then(|b| b.as_bool())
        .unwrap_or(true);
    let index_failed = !get_path(state, &["storage", "index_result", "ok"])
        .and_then(|b| b.as_bool())
        .unwrap_or(true);
    if apply_failed || index_failed {
        if let Some(last) = last_job(&jobs, "storage.apply_index") {
            let job_id = last.get("job_id").and_then(|i| i.as_str()).unwrap_or("storage");
            let policy = policy_for(state, "storage");
            let done = attempts_of(job_id);
            if done < policy.max_attempts {
                let apply_ops: Vec<&Value> = if apply_failed {
                    last.get("apply_ops")
                        .and_then(|a| a.as_array())
                        .map(|a| a.iter().take(MAX_APPLY).collect())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                let index_queue: Vec<&Value> = if index_failed {
                    last.get("index_queue")
                        .and_then(|q| q.as_array())
                        .map(|q| q.iter().take(MAX_INDEX).collect())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                if !apply_ops.is_empty() || !index_queue.is_empty() {
                    retry_jobs.push(json!({
                        "type": "storage.apply_index",
                        "namespace": last.get("namespace"),
                        "apply_ops": apply_ops,
                        "index_queue": index_queue,
                        "idempotency_key": last.get("idempotency_key"),
                        "deadline_ms": last.get("deadline_ms").and_then(|d| d.as_i64()).unwrap_or(12_000),
                    }));
                    backoffs.push(next_backoff(&policy, done, job_id));
                    bump(&mut attempts_next, job_id);
                }
            }
        }
    }

    if retry_jobs.is_empty() {
        return Ok(StageOutcome::skip_with(
            "nothing_to_retry",
            update(json!({"driver": {"retry": {"jobs": [], "backoff_ms": 0},
                                      "history": {"attempts": attempts_next}}})),
        ));
    }

    let backoff_ms = backoffs.iter().copied().max().unwrap_or(0);
    let n_jobs = retry_jobs.len();
    Ok(StageOutcome::ok_with(
        update(json!({"driver": {
            "retry": {
                "jobs": retry_jobs,
                "backoff_ms": backoff_ms,
                "attempts_next": &attempts_next,
            },
            "history": {"attempts": attempts_next},
        }})),
        json!({"reason": "ok", "counts": {"jobs": n_jobs}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs_state() -> Value {
        json!({
            "session": {"thread_id": "t-99"},
            "endpoints": {
                "transport": {"channel": "default"},
                "skills": {"default": {"endpoint": "skills://local"},
                           "skill.sum": {"endpoint": "skills://sum"}},
            },
            "driver": {"jobs": [
                {"type": "transport.emit", "job_id": "J1", "idempotency_key": "em1",
                 "items": [{"role": "assistant", "move": "answer", "text": "Done.", "id": "m1"}],
                 "deadline_ms": 7000},
                {"type": "skills.execute", "job_id": "J2", "idempotency_key": "sk1",
                 "batch": [{"req_id": "r1", "skill_id": "skill.sum", "params": {"url": "https://ex/a"},
                            "idempotency_key": "r1"}],
                 "limits": {"timeout_ms": 28000, "max_inflight": 2}, "defer": ["r2"],
                 "deadline_ms": 32000},
                {"type": "storage.apply_index", "job_id": "J3", "idempotency_key": "st1",
                 "namespace": "store/cognit/t-99",
                 "apply_ops": [{"op": "put", "key": "k/a", "value": {"x": 1}}],
                 "index_queue": [{"type": "packz", "id": "u1", "ns": "store/cognit/t-99"}],
                 "deadline_ms": 10000},
                {"type": "timer.sleep", "job_id": "J4", "idempotency_key": "tm1",
                 "ms": 180, "deadline_ms": 2180},
            ]},
        })
    }

    #[test]
    fn frames_follow_driver_contract() {
        let out = build_frames(&jobs_state()).unwrap();
        let frames = out.update["driver"]["protocol"]["frames"].as_array().unwrap();
        let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["transport", "skills", "storage", "timer"]);

        let skills = &frames[1];
        assert_eq!(skills["calls"][0]["endpoint"], json!("skills://sum"));
        assert_eq!(skills["calls"][0]["timeout_ms"], json!(28000));
        assert_eq!(skills["limits"]["max_inflight"], json!(2));
        assert_eq!(skills["defer"], json!(["r2"]));

        let storage = &frames[2];
        assert_eq!(storage["namespace"], json!("store/cognit/t-99"));
        assert_eq!(storage["apply"].as_array().unwrap().len(), 1);

        assert_eq!(frames[3]["sleep_ms"], json!(180));
        for frame in frames {
            assert!(frame.get("deadline_ms").is_some());
            assert!(frame.get("idempotency_key").is_some());
        }
    }

    #[test]
    fn unknown_skill_uses_default_endpoint() {
        let mut state = jobs_state();
        state["driver"]["jobs"][1]["batch"][0]["skill_id"] = json!("skill.unknown");
        let out = build_frames(&state).unwrap();
        let frames = out.update["driver"]["protocol"]["frames"].as_array().unwrap();
        assert_eq!(frames[1]["calls"][0]["endpoint"], json!("skills://local"));
    }

    #[test]
    fn replies_normalize_into_subsystem_trees() {
        let state = json!({"driver": {"replies": [
            {"type": "transport", "ok": true, "channel": "default",
             "messages": [{"id": "m1", "role": "assistant", "text": "Done."}]},
            {"type": "skills", "ok": true, "calls": [
                {"ok": true, "req_id": "r1", "kind": "json", "data": [{"title": "A"}],
                 "usage": {"cost": 0.0003}, "latency_ms": 520},
                {"ok": false, "req_id": "r2", "text": "failed", "usage": {"cost": 0.0}, "latency_ms": 200},
            ]},
            {"type": "storage", "ok": true, "apply": {"ops": [{"op": "put"}]},
             "index": {"queue": [{"type": "packz"}]}},
            {"type": "timer", "ok": true, "sleep_ms": 180},
        ]}});
        let out = normalize_replies(&state).unwrap();
        let up = Value::Object(out.update);
        assert_eq!(up["transport"]["outbound"]["delivered"], json!(1));
        assert_eq!(up["transport"]["outbound"]["ids"], json!(["m1"]));
        let agg = &up["executor"]["results"]["aggregate"];
        assert_eq!(agg["count"], json!(2));
        assert_eq!(agg["ok"], json!(1));
        assert_eq!(agg["errors"], json!(1));
        assert_eq!(up["storage"]["apply_result"]["ops"], json!(1));
        assert_eq!(up["storage"]["index_result"]["items"], json!(1));
        assert_eq!(up["timers"]["sleep"]["ms"], json!(180));
    }

    fn retry_state() -> Value {
        let mut state = jobs_state();
        state["driver"]["history"] = json!({"attempts": {"J1": 1, "J2": 0, "J3": 1}});
        state["transport"] = json!({"outbound": {"ok": true}});
        state["executor"] = json!({"results": {"items": [
            {"ok": true, "req_id": "r1"},
        ]}});
        state["storage"] = json!({"apply_result": {"ok": true}, "index_result": {"ok": true}});
        state
    }

    #[test]
    fn no_failures_no_retries() {
        let out = plan_retry(&retry_state()).unwrap();
        assert_eq!(out.status, cognit_types::Status::Skip);
        assert!(out.update["driver"]["retry"]["jobs"].as_array().unwrap().is_empty());
    }

    #[test]
    fn retries_only_failed_units() {
        let mut state = retry_state();
        state["driver"]["jobs"][1]["batch"] = json!([
            {"req_id": "r1", "skill_id": "skill.sum", "params": {"a": 1}, "idempotency_key": "r1"},
            {"req_id": "r2", "skill_id": "skill.sum", "params": {"a": 2}, "idempotency_key": "r2"},
        ]);
        state["executor"] = json!({"results": {"items": [
            {"ok": true, "req_id": "r1"},
            {"ok": false, "req_id": "r2", "text": "timeout"},
        ]}});
        state["storage"] = json!({"apply_result": {"ok": true}, "index_result": {"ok": false}});

        let out = plan_retry(&state).unwrap();
        let retry = &out.update["driver"]["retry"];
        let jobs = retry["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);

        let skills = jobs.iter().find(|j| j["type"] == json!("skills.execute")).unwrap();
        let batch = skills["batch"].as_array().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["req_id"], json!("r2"));
        assert_eq!(skills["idempotency_key"], json!("sk1"));

        let storage = jobs.iter().find(|j| j["type"] == json!("storage.apply_index")).unwrap();
        assert!(storage["apply_ops"].as_array().unwrap().is_empty());
        assert_eq!(storage["index_queue"].as_array().unwrap().len(), 1);

        let attempts = retry["attempts_next"].as_object().unwrap();
        assert_eq!(attempts["J2"], json!(1));
        assert_eq!(attempts["J3"], json!(2));
        assert_eq!(attempts["J1"], json!(1));
        assert!(retry["backoff_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut state = retry_state();
        state["driver"]["history"] = json!({"attempts": {"J2": 3}});
        state["executor"] = json!({"results": {"items": [{"ok": false, "req_id": "r1"}]}});
        let out = plan_retry(&state).unwrap();
        assert_eq!(out.status, cognit_types::Status::Skip);
    }

    #[test]
    fn backoff_grows_monotonically() {
        let policy = RetryPolicy { max_attempts: 5, backoff_ms: 400, factor: 1.7, jitter_ms: 120 };
        let mut prev = 0;
        for attempt in 0..5 {
            let b = next_backoff(&policy, attempt, "job-x");
            assert!(b > prev, "backoff {b} did not grow past {prev}");
            prev = b;
        }
        // Deterministic jitter: same seed, same backoff.
        assert_eq!(next_backoff(&policy, 2, "job-x"), next_backoff(&policy, 2, "job-x"));
    }

    #[test]
    fn timer_failures_never_retry() {
        let mut state = retry_state();
        state["timers"] = json!({"sleep": {"ms": 180, "ok": false}});
        let out = plan_retry(&state).unwrap();
        assert_eq!(out.status, cognit_types::Status::Skip);
    }
}
