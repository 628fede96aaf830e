use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_i64, get_path, get_str, truncate_chars, update,
};

use crate::common::{iso_from_ms, now_ms, store_namespace};

const MAX_APPLY_OPS: usize = 5000;
const MAX_INDEX_ITEMS: usize = 2000;
const MAX_TEXT_LEN: usize = 4000;

fn kv_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.trim_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------- commit

fn assistant_turn(state: &Value) -> Option<(String, String)> {
    if let Some(text) = get_str(state, &["dialog", "final", "text"]) {
        let mv = get_str(state, &["dialog", "final", "move"])
            .or_else(|| get_str(state, &["dialog", "turn", "move"]))
            .unwrap_or("answer");
        return Some((text.to_string(), mv.to_string()));
    }
    if let Some(text) = get_str(state, &["dialog", "surface", "text"]) {
        let mv = get_str(state, &["dialog", "turn", "move"])
            .or_else(|| get_str(state, &["dialog", "surface", "move"]))
            .unwrap_or("answer");
        return Some((text.to_string(), mv.to_string()));
    }
    get_str(state, &["dialog", "turn", "content"]).map(|text| {
        (
            text.to_string(),
            get_str(state, &["dialog", "turn", "move"])
                .unwrap_or("answer")
                .to_string(),
        )
    })
}

fn packz_like(turn_id: &str, text: &str, role: &str, dir: &str, time: &str) -> Value {
    json!({
        "id": turn_id,
        "text": text,
        "signals": {"direction": dir, "speech_act": null},
        "meta": {"commit_time": time, "role": role},
        "spans": {},
    })
}

/// Produce WAL operations committing the user turn, the assistant turn (with
/// plan metadata), the best execution result, and counter bumps. Turn ids
/// hash (role, clipped text, time); times derive from the tick clock.
pub fn memory_commit(state: &Value) -> Result<StageOutcome> {
    let user_text = get_str(state, &["perception", "packz", "text"])
        .or_else(|| get_str(state, &["text"]));
    let user_dir = get_str(state, &["perception", "packz", "signals", "direction"]).unwrap_or("ltr");
    let assistant = assistant_turn(state);
    let best = get_path(state, &["executor", "results", "best"])
        .filter(|b| b.as_object().map(|o| !o.is_empty()).unwrap_or(false));

    if user_text.is_none() && assistant.is_none() {
        return Ok(StageOutcome::skip_with(
            "no_turns",
            update(json!({"memory": {"wal": {"ops": []}}})),
        ));
    }

    let now = iso_from_ms(now_ms(state));
    let assistant_dir =
        get_str(state, &["world_model", "context", "features", "dir"]).unwrap_or("ltr");
    let plan = get_path(state, &["planner", "plan"]).cloned().unwrap_or_else(|| json!({}));
    let plan_meta = json!({
        "plan_id": plan.get("id"),
        "skill_id": plan.get("skill_id"),
        "skill_name": plan.get("skill_name"),
        "next_move": plan.get("next_move"),
    });

    let mut ops: Vec<Value> = Vec::new();

    if let Some(text) = user_text {
        let commit_time = get_str(state, &["perception", "packz", "meta", "commit_time"])
            .unwrap_or(&now);
        let id = content_hash(
            &json!({"role": "user", "text": truncate_chars(text, 512), "t": commit_time}),
        );
        ops.push(json!({"op": "append_turn", "turn": {
            "id": id,
            "role": "user",
            "text": truncate_chars(text, 4000),
            "lang": null,
            "move": "user_input",
            "time": commit_time,
            "packz": packz_like(&id, text, "user", user_dir, commit_time),
        }}));
    }

    let mut assistant_id: Option<String> = None;
    if let Some((text, mv)) = &assistant {
        let id = content_hash(
            &json!({"role": "assistant", "move": mv, "text": truncate_chars(text, 512), "t": now}),
        );
        ops.push(json!({"op": "append_turn", "turn": {
            "id": id,
            "role": "assistant",
            "text": truncate_chars(text, 4000),
            "lang": "en",
            "move": mv,
            "time": now,
            "packz": packz_like(&id, text, "assistant", assistant_dir, &now),
            "plan": plan_meta,
        }}));
        assistant_id = Some(id);
    }

    if let Some(best) = best {
        ops.push(json!({"op": "append_result", "result": {
            "req_id": best.get("req_id"),
            "ok": best.get("ok").and_then(|b| b.as_bool()).unwrap_or(true),
            "kind": best.get("kind"),
            "text": truncate_chars(best.get("text").and_then(|t| t.as_str()).unwrap_or(""), 2000),
            "attachments": best.get("attachments").cloned().unwrap_or_else(|| json!([])),
            "usage": best.get("usage").cloned().unwrap_or_else(|| json!({})),
            "duration_ms": best.get("duration_ms").and_then(|d| d.as_i64()).unwrap_or(0),
            "score": best.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
        }, "link": assistant_id.as_ref().map(|id| json!({"assistant_turn_id": id}))}));
    }

    // Concept versions persist alongside turns when rule extraction produced
    // a fresh one this turn.
    if let Some(version) = get_path(state, &["concept_graph", "version"])
        .filter(|v| v.get("id").and_then(|i| i.as_str()).is_some())
    {
        ops.push(json!({"op": "record_concept_version",
            "doc": version,
            "updates": get_path(state, &["concept_graph", "updates"]).cloned().unwrap_or_else(|| json!({})),
        }));
    }

    let mut counters = Map::new();
    counters.insert("turns".to_string(), json!(1));
    if assistant.is_some() {
        counters.insert("assistant_answers".to_string(), json!(1));
    }
    if ops.iter().any(|op| op["op"] == json!("append_result")) {
        counters.insert("executions".to_string(), json!(1));
    }
    ops.push(json!({"op": "bump_counters", "keys": counters}));

    let n_ops = ops.len();
    Ok(StageOutcome::ok_with(
        update(json!({"memory": {"wal": {"ops": ops}}})),
        json!({"reason": "ok", "counts": {"ops": n_ops}}),
    ))
}

// ---------------------------------------------------------------- plan apply

struct SeqCounter(Option<i64>);

impl SeqCounter {
    fn next(&mut self) -> Value {
        match &mut self.0 {
            Some(seq) => {
                let v = json!(*seq);
                *seq += 1;
                v
            }
            None => Value::Null,
        }
    }
}

/// Transform WAL ops into storage apply ops (put/inc/link under the session's
/// store namespace, with monotonic `seq`) and index-queue items.
pub fn plan_apply(state: &Value) -> Result<StageOutcome> {
    let ns = store_namespace(state);
    let wal: Vec<Value> = get_array(state, &["memory", "wal", "ops"])
        .cloned()
        .unwrap_or_default();
    if wal.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_wal",
            update(json!({
                "storage": {"apply": {"namespace": ns, "ops": []}},
                "index": {"queue": {"items": []}},
            })),
        ));
    }

    let seq_start = get_i64(state, &["storage", "last_seq"]).map(|s| s + 1);
    let mut seq = SeqCounter(seq_start);
    let mut apply_ops: Vec<Value> = Vec::new();
    let mut index_items: Vec<Value> = Vec::new();
    let (mut puts, mut incs, mut links) = (0usize, 0usize, 0usize);

    for op in &wal {
        match op.get("op").and_then(|o| o.as_str()) {
            Some("append_turn") => {
                let Some(turn) = op.get("turn").filter(|t| t.is_object()) else { continue };
                let id = turn
                    .get("id")
                    .and_then(|i| i.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| content_hash(turn));
                apply_ops.push(json!({
                    "op": "put",
                    "key": kv_key(&[ns.as_str(), "turns", id.as_str()]),
                    "value": {
                        "id": id,
                        "role": turn.get("role"),
                        "text": truncate_chars(turn.get("text").and_then(|t| t.as_str()).unwrap_or(""), MAX_TEXT_LEN),
                        "lang": turn.get("lang"),
                        "move": turn.get("move"),
                        "time": turn.get("time"),
                        "plan": turn.get("plan"),
                    },
                    "seq": seq.next(),
                }));
                puts += 1;
                if let Some(packz) = turn.get("packz").filter(|p| p.is_object()) {
                    index_items.push(json!({
                        "type": "packz",
                        "id": id,
                        "text": packz.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                        "signals": packz.get("signals").cloned().unwrap_or_else(|| json!({})),
                        "meta": packz.get("meta").cloned().unwrap_or_else(|| json!({})),
                        "ns": ns,
                    }));
                }
            }
            Some("append_result") => {
                let Some(result) = op.get("result").filter(|r| r.is_object()) else {
                    continue;
                };
                let rid = result
                    .get("req_id")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| content_hash(result));
                apply_ops.push(json!({
                    "op": "put",
                    "key": kv_key(&[ns.as_str(), "results", rid.as_str()]),
                    "value": result,
                    "seq": seq.next(),
                }));
                puts += 1;
                if let Some(link_id) = op
                    .get("link")
                    .and_then(|l| l.get("assistant_turn_id"))
                    .and_then(|i| i.as_str())
                {
                    apply_ops.push(json!({
                        "op": "link",
                        "key": kv_key(&[ns.as_str(), "links", "assistant_turn_to_result"]),
                        "value": {"assistant_turn_id": link_id, "result_req_id": rid},
                        "seq": seq.next(),
                    }));
                    links += 1;
                }
            }
            Some("bump_counters") => {
                let Some(keys) = op.get("keys").and_then(|k| k.as_object()) else {
                    continue;
                };
                for (name, delta) in keys {
                    let Some(delta) = delta.as_i64() else { continue };
                    apply_ops.push(json!({
                        "op": "inc",
                        "key": kv_key(&[ns.as_str(), "counters", name.as_str()]),
                        "delta": delta,
                        "seq": seq.next(),
                    }));
                    incs += 1;
                }
            }
            Some("record_concept_version") => {
                let Some(ver_id) = op
                    .get("doc")
                    .and_then(|d| d.get("id"))
                    .and_then(|i| i.as_str())
                else {
                    continue;
                };
                apply_ops.push(json!({
                    "op": "put", "key": kv_key(&[ns.as_str(), "concept", "versions", ver_id]),
                    "value": op.get("doc"), "seq": seq.next(),
                }));
                apply_ops.push(json!({
                    "op": "put", "key": kv_key(&[ns.as_str(), "concept", "updates", ver_id]),
                    "value": op.get("updates").cloned().unwrap_or_else(|| json!({})),
                    "seq": seq.next(),
                }));
                apply_ops.push(json!({
                    "op": "put", "key": kv_key(&[ns.as_str(), "concept", "current"]),
                    "value": {"version_id": ver_id}, "seq": seq.next(),
                }));
                puts += 3;
            }
            _ => {}
        }
    }

    let n_ops = apply_ops.len();
    let n_idx = index_items.len();
    Ok(StageOutcome::ok_with(
        update(json!({
            "storage": {"apply": {"namespace": ns, "ops": apply_ops, "meta": {"seq_start": seq_start}}},
            "index": {"queue": {"items": index_items}},
        })),
        json!({"reason": "ok", "counts": {
            "ops": n_ops, "puts": puts, "incs": incs, "links": links, "index_items": n_idx,
        }}),
    ))
}

// ---------------------------------------------------------------- optimize

fn seq_of(op: &Value) -> Option<i64> {
    op.get("seq").and_then(|s| s.as_i64())
}

/// Collapse the apply plan before dispatch: puts last-wins per key, incs sum
/// per key, links dedupe by (key, value hash); index items dedupe last-wins
/// by (type, id, namespace).
pub fn optimize_apply(state: &Value) -> Result<StageOutcome> {
    let apply_in: Vec<Value> = get_array(state, &["storage", "apply", "ops"])
        .cloned()
        .unwrap_or_default();
    let index_in: Vec<Value> = get_array(state, &["index", "queue", "items"])
        .cloned()
        .unwrap_or_default();
    if apply_in.is_empty() && index_in.is_empty() {
        return Ok(StageOutcome::skip("no_ops"));
    }
    let ns = get_str(state, &["storage", "apply", "namespace"])
        .map(str::to_string)
        .unwrap_or_else(|| store_namespace(state));

    // puts: last-wins per key by (seq, arrival).
    let mut puts: BTreeMap<String, (usize, Value)> = BTreeMap::new();
    let mut incs: BTreeMap<String, i64> = BTreeMap::new();
    let mut links: BTreeMap<(String, String), (usize, Value)> = BTreeMap::new();

    for (arrival, op) in apply_in.iter().enumerate() {
        let Some(key) = op.get("key").and_then(|k| k.as_str()) else { continue };
        match op.get("op").and_then(|o| o.as_str()) {
            Some("put") => {
                let replace = match puts.get(key) {
                    None => true,
                    Some((_, prev)) => match (seq_of(prev), seq_of(op)) {
                        (Some(old), Some(new)) => new >= old,
                        (None, None) => true,
                        (None, Some(_)) => true,
                        (Some(_), None) => false,
                    },
                };
                if replace {
                    puts.insert(key.to_string(), (arrival, op.clone()));
                }
            }
            Some("inc") => {
                if let Some(delta) = op.get("delta").and_then(|d| d.as_i64()) {
                    *incs.entry(key.to_string()).or_insert(0) += delta;
                }
            }
            Some("link") => {
                let Some(value) = op.get("value") else { continue };
                let sig = (key.to_string(), content_hash(value));
                links.insert(sig, (arrival, op.clone()));
            }
            _ => {}
        }
    }

    let order_key = |op: &Value, arrival: usize| (seq_of(op).unwrap_or(i64::MAX), arrival);
    let mut put_ops: Vec<(usize, Value)> = puts.into_values().collect();
    put_ops.sort_by_key(|(arrival, op)| order_key(op, *arrival));
    let mut link_ops: Vec<(usize, Value)> = links.into_values().collect();
    link_ops.sort_by_key(|(arrival, op)| order_key(op, *arrival));
    let inc_ops: Vec<Value> = incs
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .map(|(key, delta)| json!({"op": "inc", "key": key, "delta": delta}))
        .collect();

    let n_puts = put_ops.len();
    let n_links = link_ops.len();
    let n_incs = inc_ops.len();
    let mut out_ops: Vec<Value> = put_ops.into_iter().map(|(_, op)| op).collect();
    out_ops.extend(link_ops.into_iter().map(|(_, op)| op));
    out_ops.extend(inc_ops);
    out_ops.truncate(MAX_APPLY_OPS);

    // Index items: dedupe last-wins by (type, id, ns), preserve first-seen order.
    let mut idx_order: Vec<(String, String, String)> = Vec::new();
    let mut idx_seen: BTreeMap<(String, String, String), Value> = BTreeMap::new();
    for it in &index_in {
        let (Some(typ), Some(id), Some(item_ns)) = (
            it.get("type").and_then(|t| t.as_str()),
            it.get("id").and_then(|i| i.as_str()),
            it.get("ns").and_then(|n| n.as_str()),
        ) else {
            continue;
        };
        let mut it = it.clone();
        if let Some(text) = it.get("text").and_then(|t| t.as_str()) {
            let clipped = truncate_chars(text, MAX_TEXT_LEN);
            it["text"] = json!(clipped);
        }
        let key = (typ.to_string(), id.to_string(), item_ns.to_string());
        if !idx_seen.contains_key(&key) {
            idx_order.push(key.clone());
        }
        idx_seen.insert(key, it);
    }
    let out_items: Vec<Value> = idx_order
        .iter()
        .filter_map(|k| idx_seen.get(k).cloned())
        .take(MAX_INDEX_ITEMS)
        .collect();

    let apply_checksum = content_hash(&json!({"ns": &ns, "ops": &out_ops}));
    let index_checksum = content_hash(&json!({"items": &out_items}));
    let n_apply_in = apply_in.len();
    let n_index_in = index_in.len();
    let n_out_items = out_items.len();
    let n_out_ops = out_ops.len();

    Ok(StageOutcome::ok_with(
        update(json!({
            "storage": {"apply_optimized": {"namespace": ns, "ops": out_ops, "checksum": apply_checksum}},
            "index": {"queue_optimized": {"items": out_items, "checksum": index_checksum}},
        })),
        json!({"reason": "ok", "counts": {
            "apply_in": n_apply_in, "apply_out": n_out_ops,
            "puts": n_puts, "links": n_links, "incs": n_incs,
            "index_in": n_index_in, "index_out": n_out_items,
        }}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::deep_merge;

    fn commit_state() -> Value {
        json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-42"},
            "perception": {"packz": {
                "text": "store this please",
                "signals": {"direction": "ltr"},
                "meta": {"commit_time": "2026-01-01T00:00:00Z"},
            }},
            "dialog": {"final": {"move": "answer", "text": "Done."},
                       "turn": {"move": "answer"}},
            "executor": {"results": {"best": {
                "req_id": "r1", "ok": true, "kind": "json", "text": "{\"ok\":true}",
                "usage": {"cost": 0.0002}, "duration_ms": 420, "score": 0.7,
            }}},
            "planner": {"plan": {"id": "plan-42", "skill_id": "skill.echo",
                                 "skill_name": "Echo", "next_move": "execute"}},
        })
    }

    #[test]
    fn commit_produces_turns_result_and_counters() {
        let out = memory_commit(&commit_state()).unwrap();
        let ops = out.update["memory"]["wal"]["ops"].as_array().unwrap();
        let kinds: Vec<&str> = ops.iter().map(|o| o["op"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["append_turn", "append_turn", "append_result", "bump_counters"]
        );
        let counters = ops.last().unwrap()["keys"].as_object().unwrap();
        assert_eq!(counters["turns"], json!(1));
        assert_eq!(counters["executions"], json!(1));
    }

    #[test]
    fn apply_plan_namespaces_and_sequences() {
        let mut state = commit_state();
        state["storage"] = json!({"last_seq": 99});
        let commit = memory_commit(&state).unwrap();
        deep_merge(&mut state, Value::Object(commit.update));
        let out = plan_apply(&state).unwrap();
        let apply = &out.update["storage"]["apply"];
        assert_eq!(apply["meta"]["seq_start"], json!(100));
        let ops = apply["ops"].as_array().unwrap();
        assert!(ops[0]["key"].as_str().unwrap().starts_with("store/cognit/t-42/turns/"));
        let seqs: Vec<i64> = ops.iter().filter_map(|o| o["seq"].as_i64()).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "seq must be monotonic");
        let items = out.update["index"]["queue"]["items"].as_array().unwrap();
        assert!(items.iter().all(|i| i["type"] == json!("packz")));
    }

    #[test]
    fn optimizer_collapses_puts_incs_links() {
        let state = json!({"storage": {"apply": {"namespace": "store/cognit/t", "ops": [
            {"op": "put", "key": "k/a", "value": {"x": 1}, "seq": 1},
            {"op": "put", "key": "k/a", "value": {"x": 2}, "seq": 3},
            {"op": "inc", "key": "c/n", "delta": 2, "seq": 2},
            {"op": "inc", "key": "c/n", "delta": 3, "seq": 4},
            {"op": "link", "key": "l/x", "value": {"a": 1}, "seq": 5},
            {"op": "link", "key": "l/x", "value": {"a": 1}, "seq": 6},
            {"op": "link", "key": "l/x", "value": {"a": 2}, "seq": 7},
        ]}}});
        let out = optimize_apply(&state).unwrap();
        let ops = out.update["storage"]["apply_optimized"]["ops"].as_array().unwrap();
        let put: Vec<&Value> = ops.iter().filter(|o| o["op"] == json!("put")).collect();
        assert_eq!(put.len(), 1);
        assert_eq!(put[0]["value"]["x"], json!(2));
        let inc: Vec<&Value> = ops.iter().filter(|o| o["op"] == json!("inc")).collect();
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0]["delta"], json!(5));
        let links: Vec<&Value> = ops.iter().filter(|o| o["op"] == json!("link")).collect();
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn optimizer_dedupes_index_items_last_wins() {
        let state = json!({"index": {"queue": {"items": [
            {"type": "packz", "id": "u1", "ns": "store/cognit/t", "text": "first"},
            {"type": "packz", "id": "u1", "ns": "store/cognit/t", "text": "second"},
            {"type": "doc", "id": "d1", "ns": "store/cognit/t", "text": "other"},
        ]}}});
        let out = optimize_apply(&state).unwrap();
        let items = out.update["index"]["queue_optimized"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["text"], json!("second"));
    }
}
