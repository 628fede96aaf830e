use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{
    REPLY_LABELS, StageOutcome, char_ngrams, clamp01, get_array, get_f64, get_object, get_path,
    get_str, hash_bucket, jaccard, round3, round4, round6, text_hash, update,
};

use crate::common::parse_iso_ms;

const MAX_RECENT_FRAMES: usize = 6;
const NGRAM_N: usize = 3;
const TRACE_LIMIT: usize = 12;
const EMB_DIM: usize = 64;

type Dist = BTreeMap<&'static str, f64>;

fn base_priors() -> Dist {
    let mut d = Dist::new();
    d.insert("direct_answer", 0.25);
    d.insert("execute_action", 0.20);
    d.insert("ask_clarification", 0.15);
    d.insert("acknowledge_only", 0.10);
    d.insert("small_talk", 0.10);
    d.insert("closing", 0.05);
    d.insert("refuse_or_safecheck", 0.05);
    d.insert("other", 0.10);
    d
}

fn uniform() -> Dist {
    REPLY_LABELS
        .iter()
        .map(|l| (*l, 1.0 / REPLY_LABELS.len() as f64))
        .collect()
}

fn normalize_dist(d: &mut Dist) {
    for v in d.values_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
    let sum: f64 = d.values().sum();
    if sum <= 0.0 {
        *d = uniform();
        return;
    }
    for v in d.values_mut() {
        *v /= sum;
    }
}

fn dist_from_value(v: Option<&Value>) -> Option<Dist> {
    let obj = v?.as_object()?;
    let mut d: Dist = REPLY_LABELS
        .iter()
        .map(|l| (*l, obj.get(*l).and_then(|x| x.as_f64()).unwrap_or(0.0)))
        .collect();
    let sum: f64 = d.values().sum();
    if sum <= 0.0 {
        return None;
    }
    for val in d.values_mut() {
        *val /= sum;
    }
    Some(d)
}

fn dist_to_json(d: &Dist, digits: fn(f64) -> f64) -> Value {
    let mut out = serde_json::Map::new();
    for label in REPLY_LABELS {
        out.insert(label.to_string(), json!(digits(*d.get(label).unwrap_or(&0.0))));
    }
    Value::Object(out)
}

fn top_of(d: &Dist) -> (&'static str, f64) {
    let mut best = ("other", -1.0);
    for label in REPLY_LABELS {
        let p = *d.get(label).unwrap_or(&0.0);
        if p > best.1 {
            best = (label, p);
        }
    }
    best
}

// ---------------------------------------------------------------- context

fn frame_from_packz(pk: &Value) -> Option<Value> {
    let text = pk.get("text")?.as_str()?;
    if text.trim().is_empty() {
        return None;
    }
    let signals = pk.get("signals").cloned().unwrap_or_else(|| json!({}));
    let counts = pk.get("counts").cloned().unwrap_or_else(|| json!({}));
    Some(json!({
        "id": pk.get("id").and_then(|i| i.as_str()).unwrap_or(""),
        "text": text,
        "signals": {
            "direction": signals.get("direction"),
            "addressed_to_agent": signals.get("addressed_to_agent").and_then(|b| b.as_bool()).unwrap_or(false),
            "speech_act": signals.get("speech_act"),
            "confidence": signals.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
            "novelty": signals.get("novelty").and_then(|n| n.as_f64()).unwrap_or(0.0),
        },
        "counts": {
            "chars": counts.get("chars").and_then(|c| c.as_u64()).unwrap_or(text.chars().count() as u64),
            "words": counts.get("words").and_then(|c| c.as_u64()).unwrap_or(text.split_whitespace().count() as u64),
            "tokens": counts.get("tokens").and_then(|c| c.as_u64()).unwrap_or(0),
            "sentences": counts.get("sentences").and_then(|c| c.as_u64()).unwrap_or(0),
        },
        "meta": {
            "commit_time": pk.get("meta").and_then(|m| m.get("commit_time")).cloned().unwrap_or(Value::Null),
            "truncated_spans": pk.get("meta").and_then(|m| m.get("truncated_spans")).and_then(|b| b.as_bool()).unwrap_or(false),
        },
    }))
}

fn unwrap_packz(item: &Value) -> &Value {
    item.get("packz").filter(|p| p.is_object()).unwrap_or(item)
}

fn recent_frames(state: &Value) -> Vec<Value> {
    let mut raw: Vec<&Value> = Vec::new();
    if let Some(items) = get_array(state, &["context", "recent_packz"]) {
        raw.extend(items.iter());
    }
    if raw.is_empty() {
        if let Some(items) = get_array(state, &["memory", "retrieved_packz"]) {
            raw.extend(items.iter());
        }
    }
    let mut frames: Vec<Value> = raw
        .iter()
        .filter_map(|it| frame_from_packz(unwrap_packz(it)))
        .collect();
    frames.sort_by_key(|f| {
        f.get("meta")
            .and_then(|m| m.get("commit_time"))
            .and_then(|t| t.as_str())
            .and_then(parse_iso_ms)
            .unwrap_or(i64::MIN)
    });
    if frames.len() > MAX_RECENT_FRAMES {
        frames.split_off(frames.len() - MAX_RECENT_FRAMES)
    } else {
        frames
    }
}

/// Build the world-model context window: the current PackZ frame, up to six
/// recent frames, and similarity features against them.
pub fn build_context(state: &Value) -> Result<StageOutcome> {
    let Some(pk) = get_path(state, &["perception", "packz"]) else {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"world_model": {"context": {"current": {}, "recent": [], "features": {}}}})),
        ));
    };
    let Some(current) = frame_from_packz(pk) else {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"world_model": {"context": {"current": {}, "recent": [], "features": {}}}})),
        ));
    };

    let recent = recent_frames(state);
    let cur_text = current["text"].as_str().unwrap_or("");
    let g0 = char_ngrams(cur_text, NGRAM_N);
    let sims: Vec<f64> = recent
        .iter()
        .filter_map(|f| f.get("text").and_then(|t| t.as_str()))
        .filter(|t| !t.trim().is_empty())
        .map(|t| jaccard(&g0, &char_ngrams(t, NGRAM_N)))
        .collect();
    let sim_last = sims.last().copied().unwrap_or(0.0);
    let sim_avg = if sims.is_empty() {
        0.0
    } else {
        sims.iter().sum::<f64>() / sims.len() as f64
    };

    let sig = &current["signals"];
    let features = json!({
        "dir": sig.get("direction").and_then(|d| d.as_str()).unwrap_or("ltr"),
        "is_to_agent": sig["addressed_to_agent"].as_bool().unwrap_or(false),
        "speech_act": sig.get("speech_act").cloned().unwrap_or(Value::Null),
        "confidence": sig["confidence"].as_f64().unwrap_or(0.0),
        "novelty": sig["novelty"].as_f64().unwrap_or(0.0),
        "len_chars": current["counts"]["chars"],
        "len_tokens": current["counts"]["tokens"],
        "len_sentences": current["counts"]["sentences"],
        "sim_to_last": round3(sim_last),
        "sim_to_avg": round3(sim_avg),
        "history_size": recent.len(),
    });

    Ok(StageOutcome::ok(update(json!({"world_model": {"context": {
        "current": current,
        "recent": recent,
        "features": features,
    }}}))))
}

// ---------------------------------------------------------------- predict

fn sa_adjust(sa: &str, probs: &mut Dist, notes: &mut Vec<String>) {
    let mut add = |probs: &mut Dist, label: &'static str, delta: f64, note: &str| {
        *probs.entry(label).or_insert(0.0) += delta;
        notes.push(note.to_string());
    };
    match sa {
        "question" => {
            add(probs, "direct_answer", 0.50, "speech_act:question->direct_answer");
            add(probs, "ask_clarification", 0.10, "speech_act:question->ask_clarification");
        }
        "request" => {
            add(probs, "execute_action", 0.45, "speech_act:request->execute_action");
            add(probs, "ask_clarification", 0.10, "speech_act:request->ask_clarification");
        }
        "command" => {
            add(probs, "execute_action", 0.50, "speech_act:command->execute_action");
            add(probs, "refuse_or_safecheck", 0.05, "speech_act:command->safecheck");
        }
        "greeting" => {
            add(probs, "small_talk", 0.50, "speech_act:greeting->small_talk");
            add(probs, "acknowledge_only", 0.10, "speech_act:greeting->ack");
        }
        "thanks" => {
            add(probs, "acknowledge_only", 0.50, "speech_act:thanks->ack");
            add(probs, "closing", 0.20, "speech_act:thanks->closing");
        }
        "apology" => add(probs, "acknowledge_only", 0.30, "speech_act:apology->ack"),
        "affirmation" => {
            add(probs, "direct_answer", 0.20, "speech_act:affirmation->continue_answer");
            add(probs, "execute_action", 0.10, "speech_act:affirmation->continue_action");
        }
        "negation" => add(probs, "ask_clarification", 0.30, "speech_act:negation->clarify"),
        "exclamation" => add(probs, "small_talk", 0.10, "speech_act:exclamation->small_talk"),
        _ => {}
    }
}

fn confidence_adjust(conf: f64, sa: &str, probs: &mut Dist, notes: &mut Vec<String>) {
    let mut add = |probs: &mut Dist, label: &'static str, delta: f64, note: &str| {
        *probs.entry(label).or_insert(0.0) += delta;
        notes.push(note.to_string());
    };
    if conf < 0.4 {
        add(probs, "ask_clarification", 0.30, "low_conf->clarify");
        add(probs, "execute_action", -0.20, "low_conf->reduce_action");
        add(probs, "direct_answer", -0.10, "low_conf->reduce_answer");
    } else if conf < 0.7 {
        add(probs, "ask_clarification", 0.10, "mid_conf->slight_clarify");
    } else if conf > 0.85 {
        if sa == "request" || sa == "command" {
            add(probs, "execute_action", 0.10, "high_conf+act->execute_action");
        } else if sa == "question" {
            add(probs, "direct_answer", 0.10, "high_conf+question->direct_answer");
        }
        add(probs, "ask_clarification", -0.10, "high_conf->less_clarify");
    }
}

/// Hashed char-3-gram embedding, L2-normalized; used against learned
/// per-label prototype vectors.
fn text_embedding(text: &str) -> Vec<f64> {
    let mut vec = vec![0.0f64; EMB_DIM];
    for gram in char_ngrams(text, NGRAM_N) {
        let slot = hash_bucket(&gram, EMB_DIM as u32) as usize;
        vec[slot] += 1.0;
    }
    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn gate_hint(probs: &Dist) -> &'static str {
    if *probs.get("ask_clarification").unwrap_or(&0.0) >= 0.35 {
        "probe_first"
    } else if *probs.get("execute_action").unwrap_or(&0.0) >= 0.40 {
        "act_first"
    } else if *probs.get("direct_answer").unwrap_or(&0.0) >= 0.45 {
        "answer_first"
    } else {
        "balanced"
    }
}

/// Predict the expected-reply distribution for the next system move from
/// context features, learned transitions, and prototype similarity.
pub fn predict(state: &Value) -> Result<StageOutcome> {
    let ctx = get_path(state, &["world_model", "context"]);
    let current = ctx.and_then(|c| c.get("current")).filter(|c| {
        c.as_object().map(|o| !o.is_empty()).unwrap_or(false)
    });
    let features = ctx.and_then(|c| c.get("features"));
    let (Some(current), Some(features)) = (current, features) else {
        return Ok(StageOutcome::skip_with(
            "no_context",
            update(json!({"world_model": {"prediction": {"top": "", "expected_reply": {}, "hints": {}, "rationale": []}}})),
        ));
    };

    let mut probs = base_priors();
    let mut notes: Vec<String> = Vec::new();

    let sa = features
        .get("speech_act")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();
    let conf = features.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0);
    let nov = features.get("novelty").and_then(|n| n.as_f64()).unwrap_or(0.5);
    let addressed = features.get("is_to_agent").and_then(|b| b.as_bool()).unwrap_or(false);

    sa_adjust(&sa, &mut probs, &mut notes);
    confidence_adjust(conf, &sa, &mut probs, &mut notes);
    if !addressed {
        *probs.entry("acknowledge_only").or_insert(0.0) += 0.10;
        *probs.entry("direct_answer").or_insert(0.0) -= 0.10;
        *probs.entry("execute_action").or_insert(0.0) -= 0.10;
        notes.push("not_addressed->ack_only".to_string());
    }
    if nov > 0.7 {
        *probs.entry("ask_clarification").or_insert(0.0) += 0.10;
        notes.push("high_novelty->clarify".to_string());
    } else if nov < 0.3 {
        *probs.entry("direct_answer").or_insert(0.0) += 0.05;
        notes.push("low_novelty->direct_answer_bias".to_string());
    }

    let text = current.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let vec = text_embedding(text);

    // Prototype similarity from the learned model, when present.
    if let Some(prototypes) = get_object(state, &["world_model", "model", "prototypes"]) {
        for label in REPLY_LABELS {
            let Some(info) = prototypes.get(label) else { continue };
            let Some(proto) = info.get("vector").and_then(|v| v.as_array()) else {
                continue;
            };
            let pv: Vec<f64> = proto.iter().filter_map(|x| x.as_f64()).collect();
            let sim = cosine(&vec, &pv).max(0.0);
            if sim <= 0.0 {
                continue;
            }
            let count = info.get("count").and_then(|c| c.as_f64()).unwrap_or(1.0).max(1.0);
            let weight = (sim * count.ln_1p()).min(0.5);
            *probs.entry(label).or_insert(0.0) += weight;
            notes.push(format!("prototype:{label}:{sim:.2}"));
        }
    }

    // Learned transition row for the current speech act.
    if let Some(row) = get_object(state, &["world_model", "model", "transitions"])
        .and_then(|t| t.get(&sa))
        .and_then(|r| r.as_object())
    {
        let total: f64 = row.values().filter_map(|v| v.as_f64()).sum();
        if total > 0.0 {
            for label in REPLY_LABELS {
                if let Some(cnt) = row.get(label).and_then(|v| v.as_f64()) {
                    let w = cnt / total;
                    if w > 0.0 {
                        *probs.entry(label).or_insert(0.0) += 0.6 * w;
                        notes.push(format!("transition:{sa}->{label}:{w:.2}"));
                    }
                }
            }
        }
    }

    // Mild continuity bias toward the last predicted label.
    let mut history: Vec<Value> = get_array(state, &["world_model", "trace", "prediction_history"])
        .cloned()
        .unwrap_or_default();
    if let Some(last_label) = history
        .last()
        .and_then(|h| h.get("top"))
        .and_then(|t| t.as_str())
    {
        if let Some(slot) = REPLY_LABELS.iter().copied().find(|l| *l == last_label) {
            *probs.entry(slot).or_insert(0.0) += 0.05;
            notes.push(format!("history_bias:{last_label}"));
        }
    }

    normalize_dist(&mut probs);
    let gate = gate_hint(&probs);
    let should_collect = *probs.get("ask_clarification").unwrap_or(&0.0) >= 0.35;
    let safecheck = (sa == "command" && conf < 0.7)
        || *probs.get("execute_action").unwrap_or(&0.0) > 0.5;
    let (top, top_p) = top_of(&probs);

    let trace_entry = json!({
        "turn_id": current.get("id"),
        "text_hash": if text.is_empty() { String::new() } else { text_hash(text) },
        "top": top,
        "top_prob": round4(top_p),
        "speech_act": sa,
        "confidence": conf,
        "novelty": nov,
        "notes": notes.iter().take(TRACE_LIMIT).collect::<Vec<_>>(),
    });
    history.push(trace_entry);
    if history.len() > TRACE_LIMIT {
        history = history.split_off(history.len() - TRACE_LIMIT);
    }

    Ok(StageOutcome::ok(update(json!({"world_model": {
        "prediction": {
            "top": top,
            "expected_reply": dist_to_json(&probs, round4),
            "hints": {
                "turn_gate": gate,
                "should_collect_slots": should_collect,
                "safecheck_needed": safecheck,
            },
            "rationale": notes.iter().take(12).collect::<Vec<_>>(),
        },
        "trace": {"prediction_history": history},
    }}))))
}

// ---------------------------------------------------------------- error

fn target_for_speech_act(sa: &str) -> Dist {
    let mut t: Dist = REPLY_LABELS.iter().map(|l| (*l, 0.0)).collect();
    let set = |t: &mut Dist, pairs: &[(&'static str, f64)]| {
        for &(label, p) in pairs {
            t.insert(label, p);
        }
    };
    match sa {
        "question" => set(&mut t, &[("direct_answer", 0.75), ("ask_clarification", 0.15), ("other", 0.10)]),
        "request" => set(&mut t, &[("execute_action", 0.70), ("ask_clarification", 0.20), ("other", 0.10)]),
        "command" => set(
            &mut t,
            &[("execute_action", 0.75), ("refuse_or_safecheck", 0.10), ("ask_clarification", 0.10), ("other", 0.05)],
        ),
        "thanks" => set(&mut t, &[("acknowledge_only", 0.70), ("closing", 0.20), ("other", 0.10)]),
        "greeting" => set(&mut t, &[("small_talk", 0.70), ("acknowledge_only", 0.20), ("other", 0.10)]),
        "apology" => set(&mut t, &[("acknowledge_only", 0.60), ("other", 0.40)]),
        "affirmation" => set(
            &mut t,
            &[("direct_answer", 0.45), ("execute_action", 0.25), ("acknowledge_only", 0.20), ("other", 0.10)],
        ),
        "negation" => set(&mut t, &[("ask_clarification", 0.60), ("other", 0.40)]),
        "exclamation" => set(&mut t, &[("small_talk", 0.40), ("other", 0.60)]),
        _ => return uniform(),
    }
    t
}

fn move_to_label(mv: &str) -> &'static str {
    match mv {
        "answer" | "final_answer" => "direct_answer",
        "execute" | "action" | "dispatch" => "execute_action",
        "ask" | "clarify" | "confirm" => "ask_clarification",
        "ack" | "acknowledge" => "acknowledge_only",
        "small_talk" | "smalltalk" => "small_talk",
        "closing" | "goodbye" => "closing",
        "refuse" | "safecheck" => "refuse_or_safecheck",
        _ => "other",
    }
}

fn actual_outcome(state: &Value) -> (&'static str, Value) {
    let mv = get_str(state, &["dialog", "final", "move"])
        .or_else(|| get_str(state, &["dialog", "turn", "move"]))
        .unwrap_or("");
    let mut label = move_to_label(mv);

    let best = get_path(state, &["executor", "results", "best"]);
    let mut exec_meta = json!({});
    if let Some(best) = best.filter(|b| b.as_object().map(|o| !o.is_empty()).unwrap_or(false)) {
        let ok = best.get("ok").and_then(|b| b.as_bool()).unwrap_or(true);
        exec_meta = json!({
            "req_id": best.get("req_id"),
            "ok": ok,
            "kind": best.get("kind"),
        });
        if ok {
            label = "execute_action";
        }
    }
    (label, exec_meta)
}

fn l1_distance(p: &Dist, q: &Dist) -> f64 {
    0.5 * REPLY_LABELS
        .iter()
        .map(|l| (p.get(l).unwrap_or(&0.0) - q.get(l).unwrap_or(&0.0)).abs())
        .sum::<f64>()
}

fn kl_divergence(p: &Dist, q: &Dist) -> f64 {
    const EPS: f64 = 1e-12;
    REPLY_LABELS
        .iter()
        .map(|l| {
            let pv = p.get(l).unwrap_or(&0.0).max(EPS);
            let qv = q.get(l).unwrap_or(&0.0).max(EPS);
            pv * (pv / qv).ln()
        })
        .sum()
}

/// Compare the prediction with the actual (or speech-act-implied) outcome:
/// L1 and KL distances, a reward, and a bounded error trace.
pub fn compute_error(state: &Value) -> Result<StageOutcome> {
    let features = get_path(state, &["world_model", "context", "features"]);
    let Some(features) = features.filter(|f| f.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_context"));
    };
    let Some(pred) = dist_from_value(get_path(state, &["world_model", "prediction", "expected_reply"]))
    else {
        return Ok(StageOutcome::skip("no_prediction"));
    };

    let sa = features.get("speech_act").and_then(|s| s.as_str()).unwrap_or("");
    let target = target_for_speech_act(sa);
    let (actual_label, exec_meta) = actual_outcome(state);

    let has_move = get_str(state, &["dialog", "final", "move"]).is_some()
        || get_str(state, &["dialog", "turn", "move"]).is_some();
    let has_exec = exec_meta.as_object().map(|o| !o.is_empty()).unwrap_or(false);
    let mut actual: Dist = REPLY_LABELS.iter().map(|l| (*l, 0.0)).collect();
    if has_move || has_exec {
        actual.insert(actual_label, 1.0);
    } else {
        // No observed outcome yet: fall back to the canonical target implied
        // by the speech act.
        actual = target.clone();
        normalize_dist(&mut actual);
    }

    let l1 = round6(l1_distance(&pred, &actual));
    let kl = round6(kl_divergence(&pred, &actual));

    let (canon_label, _) = top_of(&actual);
    let pred_on_canonical = *pred.get(canon_label).unwrap_or(&0.0);
    let (top_pred, _) = top_of(&pred);
    let reward = if top_pred == canon_label {
        1.0
    } else {
        (pred_on_canonical - 0.2).max(0.0)
    };

    let trace_entry = json!({
        "actual": actual_label,
        "target": canon_label,
        "top_pred": top_pred,
        "reward": round4(reward),
        "l1": l1,
        "kl": kl,
        "speech_act": sa,
        "exec": exec_meta,
    });
    let mut history: Vec<Value> = get_array(state, &["world_model", "trace", "error_history"])
        .cloned()
        .unwrap_or_default();
    history.push(trace_entry);
    if history.len() > TRACE_LIMIT {
        history = history.split_off(history.len() - TRACE_LIMIT);
    }

    Ok(StageOutcome::ok(update(json!({"world_model": {
        "error": {
            "l1": l1,
            "kl": kl,
            "target": dist_to_json(&actual, round6),
            "predicted": dist_to_json(&pred, round6),
            "canonical_top": {"label": canon_label, "prob": round6(*actual.get(canon_label).unwrap_or(&0.0))},
            "predicted_on_canonical": round6(pred_on_canonical),
            "components": {
                "speech_act": if sa.is_empty() { Value::Null } else { json!(sa) },
                "confidence": features.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
                "actual_move": actual_label,
                "reward": round4(reward),
            },
        },
        "trace": {"error_history": history},
    }}))))
}

// ---------------------------------------------------------------- uncertainty

fn entropy01(d: &Dist) -> f64 {
    let n = REPLY_LABELS.len() as f64;
    let h: f64 = d
        .values()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    (h / n.ln()).min(1.0)
}

fn top_gap_uncertainty(d: &Dist) -> f64 {
    let mut vals: Vec<f64> = d.values().copied().collect();
    vals.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    match vals.len() {
        0 => 1.0,
        1 => 1.0 - vals[0],
        _ => 1.0 - (vals[0] - vals[1]),
    }
}

fn band(score: f64) -> &'static str {
    if score >= 0.7 {
        "high"
    } else if score >= 0.4 {
        "medium"
    } else {
        "low"
    }
}

fn recommendation(score: f64, conf: f64, act_prob: f64) -> &'static str {
    if score >= 0.7 {
        "probe_first"
    } else if score >= 0.4 {
        "answer_or_probe"
    } else if conf >= 0.8 && act_prob >= 0.45 {
        "act_first"
    } else if conf >= 0.8 {
        "answer_first"
    } else {
        "balanced"
    }
}

/// 0..1 uncertainty from distribution shape, model error, and perception
/// confidence, with a band and a next-move recommendation.
pub fn uncertainty(state: &Value) -> Result<StageOutcome> {
    let Some(dist) = dist_from_value(get_path(state, &["world_model", "prediction", "expected_reply"]))
    else {
        return Ok(StageOutcome::skip_with(
            "no_prediction",
            update(json!({"world_model": {"uncertainty": {
                "score": 1.0, "breakdown": [], "flags": ["no_prediction"],
                "band": "high", "recommendation": "probe_first",
            }}})),
        ));
    };

    let conf = get_f64(state, &["world_model", "context", "features", "confidence"]).unwrap_or(0.0);
    let nov = get_f64(state, &["world_model", "context", "features", "novelty"]).unwrap_or(0.5);
    let l1 = get_f64(state, &["world_model", "error", "l1"]).unwrap_or(0.0);
    let kl = get_f64(state, &["world_model", "error", "kl"]).unwrap_or(0.0);

    const W_ENT: f64 = 0.35;
    const W_GAP: f64 = 0.20;
    const W_ERR: f64 = 0.25;
    const W_CONF: f64 = 0.15;
    const W_NOV: f64 = 0.05;

    let u_entropy = entropy01(&dist);
    let u_gap = top_gap_uncertainty(&dist);
    let u_kl = 1.0 - (-kl.max(0.0)).exp();
    let u_err = 0.5 * l1 + 0.5 * u_kl;
    let u_conf = 1.0 - conf;
    let u_nov = nov * 0.5;

    let score = clamp01(round3(
        W_ENT * u_entropy + W_GAP * u_gap + W_ERR * u_err + W_CONF * u_conf + W_NOV * u_nov,
    ));

    let mut flags: Vec<&str> = Vec::new();
    if u_entropy >= 0.75 {
        flags.push("high_entropy");
    }
    if u_gap >= 0.75 {
        flags.push("ambiguous_top2");
    }
    if u_err >= 0.5 {
        flags.push("high_model_error");
    }
    if u_conf >= 0.5 {
        flags.push("low_confidence");
    }
    if u_nov >= 0.35 {
        flags.push("high_novelty");
    }

    let act_prob = *dist.get("execute_action").unwrap_or(&0.0);
    Ok(StageOutcome::ok(update(json!({"world_model": {"uncertainty": {
        "score": score,
        "breakdown": [
            {"name": "entropy", "value": round3(u_entropy), "weight": W_ENT, "contrib": round3(W_ENT * u_entropy)},
            {"name": "top_gap_uncertainty", "value": round3(u_gap), "weight": W_GAP, "contrib": round3(W_GAP * u_gap)},
            {"name": "model_error", "value": round3(u_err), "weight": W_ERR, "contrib": round3(W_ERR * u_err)},
            {"name": "inv_confidence", "value": round3(u_conf), "weight": W_CONF, "contrib": round3(W_CONF * u_conf)},
            {"name": "novelty_mild", "value": round3(u_nov), "weight": W_NOV, "contrib": round3(W_NOV * u_nov)},
        ],
        "flags": flags,
        "band": band(score),
        "recommendation": recommendation(score, conf, act_prob),
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_state(sa: &str, conf: f64) -> Value {
        json!({"world_model": {"context": {
            "current": {"id": "p1", "text": "summarize the report please", "signals": {"speech_act": sa}},
            "features": {
                "dir": "ltr", "is_to_agent": true, "speech_act": sa,
                "confidence": conf, "novelty": 0.5,
                "len_chars": 27, "len_tokens": 4, "len_sentences": 1,
                "sim_to_last": 0.0, "sim_to_avg": 0.0, "history_size": 0,
            },
        }}})
    }

    #[test]
    fn request_predicts_execution() {
        let out = predict(&context_state("request", 0.85)).unwrap();
        let pred = &out.update["world_model"]["prediction"];
        assert_eq!(pred["top"], json!("execute_action"));
        let dist = pred["expected_reply"].as_object().unwrap();
        let sum: f64 = dist.values().filter_map(|v| v.as_f64()).sum();
        assert!((sum - 1.0).abs() < 1e-6, "distribution sums to {sum}");
    }

    #[test]
    fn prediction_trace_is_bounded() {
        let mut state = context_state("question", 0.8);
        for _ in 0..20 {
            let out = predict(&state).unwrap();
            cognit_types::deep_merge(&mut state, Value::Object(out.update));
        }
        let hist = state["world_model"]["trace"]["prediction_history"]
            .as_array()
            .unwrap();
        assert_eq!(hist.len(), TRACE_LIMIT);
    }

    #[test]
    fn error_rewards_matching_prediction() {
        let mut state = context_state("request", 0.85);
        let out = predict(&state).unwrap();
        cognit_types::deep_merge(&mut state, Value::Object(out.update));
        let out = compute_error(&state).unwrap();
        let err = &out.update["world_model"]["error"];
        // Prediction top is execute_action and the speech-act target agrees.
        assert_eq!(err["components"]["reward"], json!(1.0));
        assert!(err["l1"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn uncertainty_prefers_peaked_distributions() {
        let peaked = json!({"world_model": {
            "prediction": {"expected_reply": {"direct_answer": 0.9, "other": 0.1}},
            "context": {"features": {"confidence": 0.9, "novelty": 0.1}},
        }});
        let flat = json!({"world_model": {
            "prediction": {"expected_reply": {
                "direct_answer": 0.125, "execute_action": 0.125, "ask_clarification": 0.125,
                "acknowledge_only": 0.125, "small_talk": 0.125, "closing": 0.125,
                "refuse_or_safecheck": 0.125, "other": 0.125,
            }},
            "context": {"features": {"confidence": 0.3, "novelty": 0.9}},
        }});
        let s1 = uncertainty(&peaked).unwrap().update["world_model"]["uncertainty"]["score"]
            .as_f64()
            .unwrap();
        let s2 = uncertainty(&flat).unwrap().update["world_model"]["uncertainty"]["score"]
            .as_f64()
            .unwrap();
        assert!(s1 < s2);
    }

    #[test]
    fn missing_prediction_is_maximal_uncertainty() {
        let out = uncertainty(&json!({})).unwrap();
        assert_eq!(out.status, cognit_types::Status::Skip);
        assert_eq!(
            out.update["world_model"]["uncertainty"]["recommendation"],
            json!("probe_first")
        );
    }
}
