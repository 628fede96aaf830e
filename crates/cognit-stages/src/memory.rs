use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{
    StageOutcome, char_ngrams, clamp01, content_hash, get_array, get_i64, get_path, get_str,
    jaccard, round6, text_hash, truncate_chars, update,
};

use crate::common::{cache_namespace, fold, iso_from_ms, now_ms, parse_iso_ms};

const WAL_STREAM: &str = "wal/cognit/perception";
const MAX_TERMS: usize = 5000;
const MAX_POS_PER_TERM: usize = 64;
const MAX_GRAMS: usize = 12_000;
const GRAM_N: usize = 3;
const SKETCH_K: usize = 64;
const DEFAULT_TOPK: usize = 5;
const MAX_RECENT: usize = 6;
const SNIPPET_MAX: usize = 160;

fn packz(state: &Value) -> Option<&Value> {
    get_path(state, &["perception", "packz"]).filter(|p| p.is_object())
}

// ---------------------------------------------------------------- wal write

/// Produce the WAL append record for the current PackZ. The record signature
/// is a hash of the canonical record so replays are detectable downstream.
pub fn wal_write(state: &Value) -> Result<StageOutcome> {
    let Some(pk) = packz(state) else {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"memory": {"wal": {}, "idempotency_key": ""}})),
        ));
    };
    let text = pk.get("text").and_then(|t| t.as_str()).unwrap_or("");
    if text.trim().is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"memory": {"wal": {}, "idempotency_key": ""}})),
        ));
    }

    let commit_time = pk
        .get("meta")
        .and_then(|m| m.get("commit_time"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| iso_from_ms(now_ms(state)));
    let id = pk
        .get("id")
        .and_then(|i| i.as_str())
        .filter(|i| !i.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| content_hash(&json!({"text": text, "commit_time": commit_time})));

    let record = json!({
        "id": id,
        "text": text,
        "counts": pk.get("counts").cloned().unwrap_or_else(|| json!({})),
        "signals": pk.get("signals").cloned().unwrap_or_else(|| json!({})),
        // Sentences stay in the WAL for indexers; heavy token/script spans do not.
        "spans": {
            "sentences": pk.get("spans").and_then(|s| s.get("sentences")).cloned().unwrap_or_else(|| json!([])),
            "tokens": [],
            "script_tags": [],
        },
        "meta": {
            "commit_time": commit_time,
            "truncated_spans": pk.get("meta").and_then(|m| m.get("truncated_spans")).and_then(|b| b.as_bool()).unwrap_or(false),
        },
    });
    let sig = content_hash(&record);

    let wal = json!({
        "stream": WAL_STREAM,
        "op": "append",
        "key": id,
        "ts": record["meta"]["commit_time"],
        "record": record,
        "sig": sig,
    });

    Ok(StageOutcome::ok(update(json!({"memory": {
        "wal": wal,
        "idempotency_key": id,
    }}))))
}

// ---------------------------------------------------------------- index ops

const EXCLUDED_TOKEN_TYPES: [&str; 2] = ["punct", "symbol"];

fn record_like(state: &Value) -> Option<&Value> {
    get_path(state, &["memory", "wal", "record"])
        .filter(|r| r.is_object())
        .or_else(|| packz(state))
}

fn collect_tokens(pk: &Value) -> Vec<(String, i64, String)> {
    if let Some(tokens) = pk
        .get("spans")
        .and_then(|s| s.get("tokens"))
        .and_then(|t| t.as_array())
        .filter(|t| !t.is_empty())
    {
        return tokens
            .iter()
            .filter_map(|t| {
                let text = t.get("text")?.as_str()?.to_string();
                let start = t.get("span")?.get("start")?.as_i64()?;
                let kind = t
                    .get("type")
                    .and_then(|k| k.as_str())
                    .unwrap_or("word")
                    .to_string();
                Some((text, start, kind))
            })
            .collect();
    }
    // Fallback: whitespace tokenization with approximate char offsets.
    let text = pk.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let mut out = Vec::new();
    let mut offset = 0i64;
    for word in text.split_whitespace() {
        out.push((word.to_string(), offset, "word".to_string()));
        offset += word.chars().count() as i64 + 1;
    }
    out
}

/// Build index operations from the WAL record: lexical postings, char-3-gram
/// term frequencies with a min-hash sketch, and a facet record.
pub fn build_index_ops(state: &Value) -> Result<StageOutcome> {
    let Some(pk) = record_like(state) else {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"memory": {"index_ops": {"doc_id": "", "ops": []}}})),
        ));
    };
    let doc_id = pk.get("id").and_then(|i| i.as_str()).unwrap_or("");
    let text = pk.get("text").and_then(|t| t.as_str()).unwrap_or("");
    if doc_id.is_empty() || text.trim().is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_packz",
            update(json!({"memory": {"index_ops": {"doc_id": "", "ops": []}}})),
        ));
    }

    // Lexical postings with position caps.
    let mut postings: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for (tok, pos, kind) in collect_tokens(pk) {
        if EXCLUDED_TOKEN_TYPES.contains(&kind.as_str()) {
            continue;
        }
        let norm = fold(&tok);
        if norm.is_empty() {
            continue;
        }
        let list = postings.entry(norm.clone()).or_default();
        if list.len() < MAX_POS_PER_TERM {
            list.push(pos);
        }
        *counts.entry(norm).or_insert(0) += 1;
    }
    let terms: Vec<Value> = postings
        .iter()
        .take(MAX_TERMS)
        .map(|(term, positions)| {
            json!({"t": term, "tf": counts.get(term).copied().unwrap_or(positions.len()), "pos": positions})
        })
        .collect();

    // Char-3-gram frequencies and a compact min-hash sketch.
    let mut gram_tf: BTreeMap<String, usize> = BTreeMap::new();
    for g in char_ngrams(&fold(text), GRAM_N) {
        if gram_tf.len() >= MAX_GRAMS && !gram_tf.contains_key(&g) {
            break;
        }
        *gram_tf.entry(g).or_insert(0) += 1;
    }
    let grams: Vec<Value> = gram_tf.iter().map(|(g, tf)| json!({"g": g, "tf": tf})).collect();
    let mut hashes: Vec<u64> = gram_tf
        .keys()
        .map(|g| {
            let h = text_hash(g);
            u64::from_str_radix(&h[..16], 16).unwrap_or(0)
        })
        .collect();
    hashes.sort_unstable();
    hashes.truncate(SKETCH_K);

    let signals = pk.get("signals").cloned().unwrap_or_else(|| json!({}));
    let date = pk
        .get("meta")
        .and_then(|m| m.get("commit_time"))
        .and_then(|t| t.as_str())
        .and_then(parse_iso_ms)
        .map(|ms| iso_from_ms(ms)[..10].to_string());
    let facets = json!({
        "dir": signals.get("direction").and_then(|d| d.as_str()).unwrap_or("ltr"),
        "sa": signals.get("speech_act"),
        "to_agent": signals.get("addressed_to_agent").and_then(|b| b.as_bool()).unwrap_or(false),
        "date": date,
    });

    let total_tf: usize = counts.values().sum();
    let unique = counts.len();
    let gram_count = grams.len();
    Ok(StageOutcome::ok_with(
        update(json!({"memory": {"index_ops": {
            "doc_id": doc_id,
            "ops": [
                {"index": "lexical", "action": "upsert", "terms": terms},
                {"index": "ngram3", "action": "upsert", "grams": grams, "sketch": hashes},
                {"index": "facet", "action": "upsert", "facets": facets},
            ],
        }}})),
        json!({"reason": "ok", "counts": {"terms": total_tf, "unique_terms": unique, "grams": gram_count}}),
    ))
}

// ---------------------------------------------------------------- retrieve

fn query_text(state: &Value) -> Option<&str> {
    get_str(state, &["perception", "packz", "text"])
        .or_else(|| get_str(state, &["perception", "normalized_text"]))
        .or_else(|| get_str(state, &["world_model", "context", "current", "text"]))
        .or_else(|| get_str(state, &["text"]))
}

fn candidates(state: &Value) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    if let Some(items) = get_array(state, &["memory", "corpus"]) {
        out.extend(items.iter().cloned());
    }
    if let Some(items) = get_array(state, &["context", "recent_packz"]) {
        for it in items {
            out.push(it.get("packz").cloned().unwrap_or_else(|| it.clone()));
        }
    }
    if let Some(items) = get_array(state, &["memory", "retrieved_packz"]) {
        out.extend(items.iter().cloned());
    }
    out
}

fn ws_tokens(s: &str) -> Vec<String> {
    fold(s).split_whitespace().map(str::to_string).collect()
}

fn recency_bonus(commit_time: Option<&str>, now: i64) -> f64 {
    let Some(ms) = commit_time.and_then(parse_iso_ms) else {
        return 0.0;
    };
    let delta_days = ((now - ms).max(0) as f64) / 86_400_000.0;
    // ~30-day half-life scaled into 0..0.1.
    0.1 * (-delta_days / 30.0).exp()
}

/// Pure retrieval over in-state candidates: char-3-gram and token Jaccard
/// blended with facet and recency bonuses.
pub fn retrieve(state: &Value) -> Result<StageOutcome> {
    let Some(q_text) = query_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_query",
            update(json!({"memory": {"retrieval": {"query": {}, "results": [], "top_k": 0}}})),
        ));
    };
    let q_text = q_text.to_string();

    let cands = candidates(state);
    if cands.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_candidates",
            update(json!({"memory": {"retrieval": {"query": {"text": q_text}, "results": [], "top_k": 0}}})),
        ));
    }

    let top_k = get_i64(state, &["retrieval", "top_k"])
        .map(|k| k.max(1) as usize)
        .unwrap_or(DEFAULT_TOPK);
    let q_feats = get_path(state, &["world_model", "context", "features"])
        .cloned()
        .unwrap_or_else(|| json!({}));
    let q_grams = char_ngrams(&fold(&q_text), GRAM_N);
    let q_toks = ws_tokens(&q_text);
    let now = now_ms(state);

    let mut scored: Vec<Value> = Vec::new();
    for cand in &cands {
        let cand = cand.get("packz").unwrap_or(cand);
        let (Some(c_text), Some(c_id)) = (
            cand.get("text").and_then(|t| t.as_str()),
            cand.get("id").and_then(|i| i.as_str()),
        ) else {
            continue;
        };
        if c_text.is_empty() || c_id.is_empty() {
            continue;
        }
        let sig = cand.get("signals").cloned().unwrap_or_else(|| json!({}));
        let commit = cand
            .get("meta")
            .and_then(|m| m.get("commit_time"))
            .and_then(|t| t.as_str());

        let gram_j = jaccard(&q_grams, &char_ngrams(&fold(c_text), GRAM_N));
        let tok_j = jaccard(&q_toks, &ws_tokens(c_text));
        let mut facet_bonus = 0.0;
        if q_feats.get("dir").and_then(|d| d.as_str()).is_some()
            && q_feats.get("dir") == sig.get("direction")
        {
            facet_bonus += 0.03;
        }
        if let (Some(qa), Some(ca)) = (
            q_feats.get("speech_act").and_then(|s| s.as_str()),
            sig.get("speech_act").and_then(|s| s.as_str()),
        ) {
            if fold(qa) == fold(ca) {
                facet_bonus += 0.02;
            }
        }
        let r_bonus = recency_bonus(commit, now);
        let score = round6(clamp01(0.6 * gram_j + 0.3 * tok_j + facet_bonus + r_bonus));

        scored.push(json!({
            "id": c_id,
            "score": score,
            "components": {
                "gram_jaccard": round6(gram_j),
                "token_jaccard": round6(tok_j),
                "facet_bonus": round6(facet_bonus),
                "recency_bonus": round6(r_bonus),
            },
            "snippet": truncate_chars(c_text.trim(), 120),
            "facets": {
                "dir": sig.get("direction"),
                "sa": sig.get("speech_act"),
                "commit_time": commit,
            },
        }));
    }

    scored.sort_by(|a, b| {
        let sa = a["score"].as_f64().unwrap_or(0.0);
        let sb = b["score"].as_f64().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    let returned: Vec<Value> = scored.iter().take(top_k).cloned().collect();
    let n_cands = cands.len();
    let n_ret = returned.len();

    Ok(StageOutcome::ok_with(
        update(json!({"memory": {"retrieval": {
            "query": {"text": q_text, "features": q_feats},
            "results": returned,
            "top_k": top_k,
        }}})),
        json!({"reason": "ok", "counts": {"candidates": n_cands, "returned": n_ret}}),
    ))
}

// ---------------------------------------------------------------- context cache

fn cache_entry(item: &Value) -> Option<Value> {
    let pk = item.get("packz").filter(|p| p.is_object()).unwrap_or(item);
    let id = pk.get("id")?.as_str()?;
    let text = pk.get("text")?.as_str()?;
    if id.is_empty() || text.is_empty() {
        return None;
    }
    let sig = pk.get("signals").cloned().unwrap_or_else(|| json!({}));
    Some(json!({
        "id": id,
        "text": truncate_chars(text.trim(), SNIPPET_MAX),
        "signals": {"direction": sig.get("direction"), "speech_act": sig.get("speech_act")},
        "meta": {"commit_time": pk.get("meta").and_then(|m| m.get("commit_time")).cloned().unwrap_or(Value::Null)},
    }))
}

fn entry_time(e: &Value) -> i64 {
    e.get("meta")
        .and_then(|m| m.get("commit_time"))
        .and_then(|t| t.as_str())
        .and_then(parse_iso_ms)
        .unwrap_or(i64::MIN)
}

/// Maintain the small LRU of recent PackZ frames plus the last retrieval
/// summary as cache ops; the persistence layer applies them.
pub fn context_cache(state: &Value) -> Result<StageOutcome> {
    let ns = cache_namespace(state);

    let mut entries: Vec<Value> = Vec::new();
    if let Some(items) = get_array(state, &["context", "recent_packz"]) {
        entries.extend(items.iter().filter_map(cache_entry));
    }
    if let Some(items) = get_array(state, &["memory", "retrieved_packz"]) {
        entries.extend(items.iter().filter_map(cache_entry));
    }
    if let Some(pk) = packz(state) {
        if let Some(entry) = cache_entry(pk) {
            entries.push(entry);
        }
    }

    let retrieval = get_path(state, &["memory", "retrieval"]).and_then(|r| {
        let results = r.get("results")?.as_array()?;
        if results.is_empty() {
            return None;
        }
        let top_k = r
            .get("top_k")
            .and_then(|k| k.as_u64())
            .unwrap_or(results.len() as u64) as usize;
        let items: Vec<Value> = results
            .iter()
            .filter_map(|it| {
                Some(json!({"id": it.get("id")?.as_str()?, "score": it.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0)}))
            })
            .take(top_k)
            .collect();
        if items.is_empty() {
            None
        } else {
            Some(json!({"top_k": top_k, "items": items}))
        }
    });

    if entries.is_empty() && retrieval.is_none() {
        return Ok(StageOutcome::skip_with(
            "no_input",
            update(json!({"memory": {"context_cache": {"namespace": ns, "ops": []}}})),
        ));
    }

    // Dedupe by id keeping the newest, sort ascending by commit time, keep
    // the last MAX_RECENT.
    let mut by_id: BTreeMap<String, Value> = BTreeMap::new();
    for e in entries {
        let id = e["id"].as_str().unwrap_or("").to_string();
        match by_id.get(&id) {
            Some(prev) if entry_time(prev) > entry_time(&e) => {}
            _ => {
                by_id.insert(id, e);
            }
        }
    }
    let mut recent: Vec<Value> = by_id.into_values().collect();
    recent.sort_by_key(entry_time);
    let evicted: Vec<Value> = if recent.len() > MAX_RECENT {
        let cut = recent.len() - MAX_RECENT;
        let dropped: Vec<Value> = recent[..cut].iter().map(|e| e["id"].clone()).collect();
        recent = recent.split_off(cut);
        dropped
    } else {
        Vec::new()
    };

    let mut ops = vec![
        json!({"op": "put", "key": "recent_packz", "value": recent}),
        json!({"op": "touch", "key": "last_seen_at", "value": iso_from_ms(now_ms(state))}),
    ];
    if let Some(r) = &retrieval {
        ops.push(json!({"op": "put", "key": "last_retrieval", "value": r}));
    }
    if !evicted.is_empty() {
        ops.push(json!({"op": "evict", "key": "evicted_ids", "value": evicted}));
    }

    let n_recent = ops[0]["value"].as_array().map(|a| a.len()).unwrap_or(0);
    let n_evicted = evicted_len(&ops);
    Ok(StageOutcome::ok_with(
        update(json!({"memory": {"context_cache": {"namespace": ns, "ops": ops}}})),
        json!({"reason": "ok", "counts": {"recent": n_recent, "evicted": n_evicted}}),
    ))
}

fn evicted_len(ops: &[Value]) -> usize {
    ops.iter()
        .find(|op| op["key"] == json!("evicted_ids"))
        .and_then(|op| op["value"].as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packz_state(text: &str) -> Value {
        json!({"perception": {"packz": {
            "id": text_hash(text),
            "text": text,
            "counts": {"chars": text.len(), "words": 2, "tokens": 0, "sentences": 1},
            "signals": {"direction": "ltr", "addressed_to_agent": true, "speech_act": "request",
                        "confidence": 0.8, "novelty": 0.6},
            "meta": {"commit_time": "2026-01-01T00:00:00Z", "truncated_spans": false},
            "spans": {"sentences": [], "tokens": [], "script_tags": []},
        }}})
    }

    #[test]
    fn wal_record_signature_is_deterministic() {
        let state = packz_state("remember this");
        let a = wal_write(&state).unwrap();
        let b = wal_write(&state).unwrap();
        assert_eq!(a.update["memory"]["wal"]["sig"], b.update["memory"]["wal"]["sig"]);
        assert_eq!(
            a.update["memory"]["idempotency_key"],
            a.update["memory"]["wal"]["key"]
        );
    }

    #[test]
    fn index_ops_cover_three_indexes() {
        let mut state = packz_state("index this text now");
        let wal = wal_write(&state).unwrap();
        cognit_types::deep_merge(&mut state, Value::Object(wal.update));
        let out = build_index_ops(&state).unwrap();
        let ops = out.update["memory"]["index_ops"]["ops"].as_array().unwrap();
        let kinds: Vec<&str> = ops.iter().map(|o| o["index"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["lexical", "ngram3", "facet"]);
    }

    #[test]
    fn retrieval_ranks_by_similarity() {
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "perception": {"packz": {"id": "q", "text": "summary of the architecture",
                "signals": {"direction": "ltr", "speech_act": "request"}}},
            "memory": {"corpus": [
                {"id": "d1", "text": "yesterday we discussed folders",
                 "meta": {"commit_time": "2026-01-01T00:00:00Z"}},
                {"id": "d2", "text": "summary of the architecture: ten blocks",
                 "meta": {"commit_time": "2026-01-02T00:00:00Z"}},
            ]},
            "retrieval": {"top_k": 1},
        });
        let out = retrieve(&state).unwrap();
        let results = out.update["memory"]["retrieval"]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], json!("d2"));
    }

    #[test]
    fn cache_evicts_beyond_capacity() {
        let recents: Vec<Value> = (0..8)
            .map(|i| {
                json!({"packz": {
                    "id": format!("old-{i}"), "text": format!("message number {i}"),
                    "meta": {"commit_time": format!("2026-01-0{}T00:00:00Z", i + 1)},
                }})
            })
            .collect();
        let state = json!({
            "clock": {"now_ms": 1_700_000_000_000_i64},
            "session": {"thread_id": "t-1"},
            "context": {"recent_packz": recents},
        });
        let out = context_cache(&state).unwrap();
        let ops = out.update["memory"]["context_cache"]["ops"].as_array().unwrap().clone();
        let recent = ops[0]["value"].as_array().unwrap();
        assert_eq!(recent.len(), MAX_RECENT);
        let evicted = ops
            .iter()
            .find(|op| op["key"] == json!("evicted_ids"))
            .unwrap();
        assert_eq!(evicted["value"].as_array().unwrap().len(), 2);
        assert_eq!(
            out.update["memory"]["context_cache"]["namespace"],
            json!("cache/cognit/t-1")
        );
    }
}
