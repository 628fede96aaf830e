use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_path, round6, truncate_chars, update,
};

use crate::common::fold;

const MAX_DOCS: usize = 12;
const MAX_TERMS_OUT: usize = 500;
const MAX_EDGES_OUT: usize = 1000;
const MAX_SURFACES: usize = 3;
const NGRAM_MAX_N: usize = 3;
const WINDOW_SIZE: usize = 6;
const INTENT_PREFIX: &str = "intent::";
const TRACE_EDGE_WEIGHT: f64 = 0.8;

const MAX_NODES_OUT: usize = 600;
const MAX_SURFACES_PER_NODE: usize = 5;
const MAX_SCORED_EDGES: usize = 1200;
const MAX_LABELS_PER_EDGE: usize = 3;

const MAX_RULES_OUT: usize = 1200;
const THRESH_ASSOC_W: f64 = 0.45;
const THRESH_SYNONYM_JACC: f64 = 0.9;
const THRESH_SYNONYM_W_MIN: f64 = 0.30;
const THRESH_SUBSUME_W: f64 = 0.35;

const STOPWORDS: [&str; 29] = [
    "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "with", "at", "by", "from",
    "is", "are", "was", "were", "be", "as", "that", "this", "it", "its", "if", "but", "into",
    "then", "not",
];

fn canon_term(s: &str) -> String {
    let cleaned: String = fold(s)
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '-' || c == '\'' || c == '’' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn candidate_terms(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| fold(t))
        .filter(|t| {
            !t.is_empty()
                && t.chars().all(|c| c.is_alphabetic() || c == '-' || c == '\'' || c == '’')
                && !STOPWORDS.contains(&t.as_str())
        })
        .collect()
}

fn lang_hint(s: &str) -> &'static str {
    for ch in s.chars() {
        let cp = ch as u32;
        if (0x0600..=0x06FF).contains(&cp) || (0x0750..=0x08FF).contains(&cp) {
            return "ar";
        }
    }
    if s.chars().any(|c| c.is_ascii_alphabetic()) {
        "en"
    } else {
        "und"
    }
}

// ---------------------------------------------------------------- mining

fn doc_list(state: &Value) -> Vec<Value> {
    let mut seen: BTreeMap<String, Value> = BTreeMap::new();
    let mut push = |item: &Value| {
        let pk = item.get("packz").filter(|p| p.is_object()).unwrap_or(item);
        let (Some(id), Some(text)) = (
            pk.get("id").and_then(|i| i.as_str()),
            pk.get("text").and_then(|t| t.as_str()),
        ) else {
            return;
        };
        if !id.is_empty() && !text.is_empty() {
            seen.insert(id.to_string(), pk.clone());
        }
    };
    if let Some(pk) = get_path(state, &["perception", "packz"]) {
        push(pk);
    }
    if let Some(items) = get_array(state, &["memory", "corpus"]) {
        items.iter().for_each(&mut push);
    }
    if let Some(items) = get_array(state, &["context", "recent_packz"]) {
        items.iter().for_each(&mut push);
    }
    seen.into_values().take(MAX_DOCS).collect()
}

struct TraceSample {
    reward: f64,
    target: String,
    actual: String,
    top_pred: String,
}

fn trace_samples(state: &Value) -> Vec<TraceSample> {
    let Some(items) = get_array(state, &["world_model", "trace", "error_history"]) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|it| {
            let reward = it.get("reward")?.as_f64()?;
            let target = it.get("target").and_then(|t| t.as_str());
            let actual = it.get("actual").and_then(|t| t.as_str());
            let top_pred = it.get("top_pred").and_then(|t| t.as_str());
            if target.is_none() && actual.is_none() && top_pred.is_none() {
                return None;
            }
            let fallback = top_pred.or(target).or(actual).unwrap_or("other");
            Some(TraceSample {
                reward,
                target: target.unwrap_or(fallback).to_string(),
                actual: actual.unwrap_or(fallback).to_string(),
                top_pred: top_pred.unwrap_or(fallback).to_string(),
            })
        })
        .collect()
}

fn intent_key(label: &str) -> String {
    format!("{INTENT_PREFIX}{label}")
}

fn mine_doc(
    pk: &Value,
    term_tf: &mut BTreeMap<String, usize>,
    ngram_tf: &mut BTreeMap<String, usize>,
    pairs: &mut BTreeMap<(String, String), usize>,
    surfaces: &mut BTreeMap<String, Vec<String>>,
    doc_ngrams: &mut Vec<BTreeSet<String>>,
) {
    let text = pk.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let sentences: Vec<String> = pk
        .get("spans")
        .and_then(|s| s.get("sentences"))
        .and_then(|s| s.as_array())
        .map(|sents| {
            sents
                .iter()
                .filter_map(|s| s.get("text").and_then(|t| t.as_str()))
                .map(str::to_string)
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec![text.to_string()]);

    let mut this_doc: BTreeSet<String> = BTreeSet::new();
    for sentence in &sentences {
        let tokens: Vec<String> = sentence.split_whitespace().map(str::to_string).collect();
        let terms = candidate_terms(&tokens);
        if terms.is_empty() {
            continue;
        }

        for t in &terms {
            *term_tf.entry(t.clone()).or_insert(0) += 1;
        }
        for n in 1..=NGRAM_MAX_N.min(terms.len()) {
            for window in terms.windows(n) {
                let gram = window.join(" ");
                *ngram_tf.entry(gram.clone()).or_insert(0) += 1;
                this_doc.insert(gram.clone());
                let surf = surfaces.entry(gram).or_default();
                if surf.len() < MAX_SURFACES {
                    surf.push(truncate_chars(sentence, 120));
                }
            }
        }
        for i in 0..terms.len() {
            for j in (i + 1)..terms.len().min(i + 1 + WINDOW_SIZE) {
                if terms[i] == terms[j] {
                    continue;
                }
                let (a, b) = if terms[i] < terms[j] {
                    (terms[i].clone(), terms[j].clone())
                } else {
                    (terms[j].clone(), terms[i].clone())
                };
                *pairs.entry((a, b)).or_insert(0) += 1;
            }
        }
    }
    doc_ngrams.push(this_doc);
}

/// Mine term/n-gram patterns and windowed co-occurrence edges from PackZ
/// documents, plus intent patterns from the world-model error trace.
pub fn mine_patterns(state: &Value) -> Result<StageOutcome> {
    let docs = doc_list(state);
    let trace = trace_samples(state);
    if docs.is_empty() && trace.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_docs",
            update(json!({"concept_graph": {"patterns": {"terms": [], "edges": [], "meta": {"docs": 0, "trace_samples": 0}}}})),
        ));
    }

    let mut term_tf: BTreeMap<String, usize> = BTreeMap::new();
    let mut ngram_tf: BTreeMap<String, usize> = BTreeMap::new();
    let mut pairs: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut surfaces: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut doc_ngrams: Vec<BTreeSet<String>> = Vec::new();

    for pk in &docs {
        mine_doc(pk, &mut term_tf, &mut ngram_tf, &mut pairs, &mut surfaces, &mut doc_ngrams);
    }

    let mut df: BTreeMap<&String, usize> = BTreeMap::new();
    for grams in &doc_ngrams {
        for g in grams {
            *df.entry(g).or_insert(0) += 1;
        }
    }

    let total_terms: usize = term_tf.values().sum::<usize>().max(1);
    let total_pairs: usize = pairs.values().sum::<usize>().max(1);
    let pmi = |a: &str, b: &str, cooc: usize| -> f64 {
        let pa = term_tf.get(a).copied().unwrap_or(1) as f64 / total_terms as f64;
        let pb = term_tf.get(b).copied().unwrap_or(1) as f64 / total_terms as f64;
        let pab = cooc as f64 / total_pairs as f64;
        (pab / (pa * pb).max(1e-12)).log2().max(0.0)
    };

    let mut terms_out: Vec<Value> = ngram_tf
        .iter()
        .map(|(k, tf)| {
            json!({
                "key": k,
                "tf": tf,
                "df": df.get(k).copied().unwrap_or(1),
                "surfaces": surfaces.get(k).cloned().unwrap_or_default(),
            })
        })
        .collect();
    let mut edges_out: Vec<Value> = pairs
        .iter()
        .map(|((a, b), cooc)| {
            json!({"a": a, "b": b, "cooc": cooc, "pmi": round6(pmi(a, b, *cooc))})
        })
        .collect();

    // Intent terms and reward-weighted intent edges from the error trace.
    if !trace.is_empty() {
        let mut intent_tf: BTreeMap<String, usize> = BTreeMap::new();
        let mut intent_edges: BTreeMap<(String, String), (usize, f64)> = BTreeMap::new();
        for s in &trace {
            let labels: BTreeSet<&String> = [&s.target, &s.actual, &s.top_pred].into_iter().collect();
            for l in labels {
                *intent_tf.entry(intent_key(l)).or_insert(0) += 1;
            }
            for (a, b, w) in [
                (&s.target, &s.actual, 1.0),
                (&s.target, &s.top_pred, TRACE_EDGE_WEIGHT),
            ] {
                if a == b {
                    continue;
                }
                let (ka, kb) = {
                    let (x, y) = if a < b { (a, b) } else { (b, a) };
                    (intent_key(x), intent_key(y))
                };
                let entry = intent_edges.entry((ka, kb)).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += s.reward * w;
            }
        }
        for (key, tf) in &intent_tf {
            let label = key.strip_prefix(INTENT_PREFIX).unwrap_or(key);
            terms_out.push(json!({
                "key": key,
                "tf": tf,
                "df": tf / 2 + 1,
                "surfaces": [format!("Policy intent — {}", label.replace('_', " "))],
            }));
        }
        for ((a, b), (cooc, reward_sum)) in &intent_edges {
            let reward_avg = reward_sum / *cooc as f64;
            edges_out.push(json!({
                "a": a, "b": b, "cooc": cooc,
                "pmi": round6(reward_avg * (*cooc as f64).ln_1p()),
                "reward_avg": round6(reward_avg),
            }));
        }
    }

    terms_out.sort_by(|x, y| {
        let tx = x["tf"].as_u64().unwrap_or(0);
        let ty = y["tf"].as_u64().unwrap_or(0);
        ty.cmp(&tx).then_with(|| {
            y["df"].as_u64().unwrap_or(0).cmp(&x["df"].as_u64().unwrap_or(0))
        })
    });
    terms_out.truncate(MAX_TERMS_OUT);
    edges_out.sort_by(|x, y| {
        let cx = x["cooc"].as_u64().unwrap_or(0);
        let cy = y["cooc"].as_u64().unwrap_or(0);
        cy.cmp(&cx).then_with(|| {
            y["pmi"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&x["pmi"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    edges_out.truncate(MAX_EDGES_OUT);

    let counts = json!({
        "docs": docs.len(), "terms": terms_out.len(),
        "pairs": edges_out.len(), "trace_samples": trace.len(),
    });
    Ok(StageOutcome::ok_with(
        update(json!({"concept_graph": {"patterns": {
            "terms": terms_out,
            "edges": edges_out,
            "meta": {"docs": docs.len(), "trace_samples": trace.len()},
        }}})),
        json!({"reason": "ok", "counts": counts}),
    ))
}

// ---------------------------------------------------------------- nodes

fn node_id(key: &str, n: usize, lang: &str) -> String {
    content_hash(&json!({"key": key, "n": n, "lang": lang}))
}

fn idf(doc_count: usize, df: usize) -> f64 {
    1.0 + ((1.0 + doc_count.max(1) as f64) / (1.0 + df.max(1) as f64)).ln()
}

fn node_score(tf: usize, df: usize, doc_count: usize, n: usize) -> f64 {
    let mut base = tf as f64 * idf(doc_count, df);
    if n == 2 {
        base *= 1.08;
    } else if n >= 3 {
        base *= 1.15;
    }
    round6(base)
}

/// Canonicalize mined terms into concept nodes; node ids are hashes of
/// (canonical key, n-gram size, language hint). Existing nodes merge in.
pub fn manage_nodes(state: &Value) -> Result<StageOutcome> {
    let terms = get_array(state, &["concept_graph", "patterns", "terms"])
        .cloned()
        .unwrap_or_default();
    let existing: Vec<Value> = get_array(state, &["concept_graph", "nodes", "nodes"])
        .cloned()
        .unwrap_or_default();
    if terms.is_empty() && existing.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_terms",
            update(json!({"concept_graph": {"nodes": {"nodes": [], "term_to_node": {}}}})),
        ));
    }

    let doc_count = get_path(state, &["concept_graph", "patterns", "meta", "docs"])
        .and_then(|d| d.as_u64())
        .map(|d| d as usize)
        .filter(|d| *d > 0)
        .unwrap_or(10);

    let mut by_key: BTreeMap<(String, usize, String), Value> = BTreeMap::new();
    let merged_from_existing = existing.len();
    for en in &existing {
        let Some(key) = en.get("key").and_then(|k| k.as_str()).filter(|k| !k.is_empty()) else {
            continue;
        };
        let n = en.get("n").and_then(|n| n.as_u64()).unwrap_or(0) as usize;
        let lang = en
            .get("lang")
            .and_then(|l| l.as_str())
            .unwrap_or_else(|| lang_hint(key))
            .to_string();
        let node = json!({
            "id": en.get("id").and_then(|i| i.as_str()).map(str::to_string)
                    .unwrap_or_else(|| node_id(key, n, &lang)),
            "key": key,
            "n": n,
            "lang": lang,
            "tf": en.get("tf").and_then(|v| v.as_u64()).unwrap_or(0),
            "df": en.get("df").and_then(|v| v.as_u64()).unwrap_or(1),
            "score": en.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
            "surfaces": en.get("surfaces").cloned().unwrap_or_else(|| json!([])),
            "aliases": en.get("aliases").cloned().unwrap_or_else(|| json!([])),
        });
        by_key.insert((key.to_string(), n, node["lang"].as_str().unwrap().to_string()), node);
    }

    let mut term_to_node: BTreeMap<String, String> = BTreeMap::new();
    for t in &terms {
        let Some(raw) = t.get("key").and_then(|k| k.as_str()).filter(|k| !k.is_empty()) else {
            continue;
        };
        let key = canon_term(raw);
        if key.is_empty() {
            continue;
        }
        let n = key.split_whitespace().count();
        let lang = lang_hint(&key).to_string();
        let id = node_id(&key, n, &lang);
        let tf = t.get("tf").and_then(|v| v.as_u64()).unwrap_or(0);
        let df = t.get("df").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
        let new_surfaces: Vec<String> = t
            .get("surfaces")
            .and_then(|s| s.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
            .unwrap_or_default();

        let slot = by_key.entry((key.clone(), n, lang.clone())).or_insert_with(|| {
            json!({"id": id, "key": key, "n": n, "lang": lang, "tf": 0, "df": 0,
                   "score": 0.0, "surfaces": [], "aliases": []})
        });
        slot["tf"] = json!(slot["tf"].as_u64().unwrap_or(0) + tf);
        slot["df"] = json!(slot["df"].as_u64().unwrap_or(0).max(df));
        let mut surfaces: Vec<String> = slot["surfaces"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
            .unwrap_or_default();
        for s in new_surfaces {
            if surfaces.len() >= MAX_SURFACES_PER_NODE {
                break;
            }
            if !surfaces.contains(&s) {
                surfaces.push(s);
            }
        }
        slot["surfaces"] = json!(surfaces);
        if canon_term(raw) != fold(raw) {
            let mut aliases: Vec<String> = slot["aliases"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
                .unwrap_or_default();
            if aliases.len() < MAX_SURFACES_PER_NODE && !aliases.contains(&raw.to_string()) {
                aliases.push(raw.to_string());
            }
            slot["aliases"] = json!(aliases);
        }
        term_to_node.insert(raw.to_string(), slot["id"].as_str().unwrap_or("").to_string());
    }

    let mut nodes: Vec<Value> = by_key
        .into_values()
        .map(|mut node| {
            let tf = node["tf"].as_u64().unwrap_or(0) as usize;
            let df = node["df"].as_u64().unwrap_or(1) as usize;
            let n = node["n"].as_u64().unwrap_or(1) as usize;
            node["score"] = json!(node_score(tf, df, doc_count, n));
            node
        })
        .collect();
    nodes.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["score"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b["tf"].as_u64().unwrap_or(0).cmp(&a["tf"].as_u64().unwrap_or(0)))
    });
    nodes.truncate(MAX_NODES_OUT);

    let n_in = terms.len();
    let n_out = nodes.len();
    Ok(StageOutcome::ok_with(
        update(json!({"concept_graph": {"nodes": {
            "nodes": nodes,
            "term_to_node": term_to_node,
        }}})),
        json!({"reason": "ok", "counts": {
            "input_terms": n_in, "output_nodes": n_out,
            "merged_from_existing": merged_from_existing,
        }}),
    ))
}

// ---------------------------------------------------------------- edges

fn squash_pos(x: f64) -> f64 {
    1.0 - (-x.max(0.0)).exp()
}

/// Map mined term pairs onto node pairs and weight them by squashed PMI,
/// co-occurrence support, and node strength.
pub fn score_edges(state: &Value) -> Result<StageOutcome> {
    let pat_edges = get_array(state, &["concept_graph", "patterns", "edges"])
        .cloned()
        .unwrap_or_default();
    if pat_edges.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_edges",
            update(json!({"concept_graph": {"edges": {"edges": []}}})),
        ));
    }
    let nodes = get_array(state, &["concept_graph", "nodes", "nodes"])
        .cloned()
        .unwrap_or_default();
    if nodes.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_nodes",
            update(json!({"concept_graph": {"edges": {"edges": []}}})),
        ));
    }

    let t2n: BTreeMap<String, String> =
        get_path(state, &["concept_graph", "nodes", "term_to_node"])
            .and_then(|m| m.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
    let mut canon_idx: BTreeMap<String, String> = BTreeMap::new();
    let mut score_by_id: BTreeMap<String, f64> = BTreeMap::new();
    for n in &nodes {
        let Some(id) = n.get("id").and_then(|i| i.as_str()) else { continue };
        score_by_id.insert(id.to_string(), n.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0));
        if let Some(key) = n.get("key").and_then(|k| k.as_str()) {
            canon_idx.insert(canon_term(key), id.to_string());
        }
        for field in ["aliases", "surfaces"] {
            if let Some(items) = n.get(field).and_then(|a| a.as_array()) {
                for it in items.iter().filter_map(|v| v.as_str()) {
                    canon_idx.entry(canon_term(it)).or_insert_with(|| id.to_string());
                }
            }
        }
    }
    let resolve = |term: &str| -> Option<String> {
        t2n.get(term)
            .cloned()
            .or_else(|| canon_idx.get(&canon_term(term)).cloned())
    };

    let mut agg: BTreeMap<(String, String), (f64, u64, f64, Vec<String>)> = BTreeMap::new();
    let mut linked = 0usize;
    for e in &pat_edges {
        let (Some(a), Some(b)) = (
            e.get("a").and_then(|v| v.as_str()),
            e.get("b").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let (Some(na), Some(nb)) = (resolve(a), resolve(b)) else { continue };
        if na == nb {
            continue;
        }
        let (u, v) = if na < nb { (na, nb) } else { (nb, na) };
        let pmi = e.get("pmi").and_then(|p| p.as_f64()).unwrap_or(0.0);
        let cooc = e.get("cooc").and_then(|c| c.as_u64()).unwrap_or(0);
        let reward = e.get("reward_avg").and_then(|r| r.as_f64()).unwrap_or(0.0);
        let entry = agg.entry((u, v)).or_insert((0.0, 0, 0.0, Vec::new()));
        entry.0 = entry.0.max(pmi);
        entry.1 += cooc;
        entry.2 = entry.2.max(reward);
        if entry.3.len() < MAX_LABELS_PER_EDGE {
            entry.3.push(format!("{a} ~ {b}"));
        }
        linked += 1;
    }

    if agg.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_mapping",
            update(json!({"concept_graph": {"edges": {"edges": []}}})),
        ));
    }

    let mut out: Vec<Value> = agg
        .into_iter()
        .map(|((u, v), (pmi, cooc, reward, labels))| {
            let ns = score_by_id
                .get(&u)
                .copied()
                .unwrap_or(0.0)
                .min(score_by_id.get(&v).copied().unwrap_or(0.0));
            let pmi_n = squash_pos(pmi);
            let cooc_n = squash_pos(cooc as f64 / 5.0);
            let ns_n = squash_pos(ns / 3.0);
            let w = round6((0.5 * pmi_n + 0.3 * cooc_n + 0.2 * ns_n).clamp(0.0, 1.0));
            json!({
                "u": u, "v": v, "w": w,
                "pmi": round6(pmi), "cooc": cooc, "support": cooc,
                "reward_avg": round6(reward),
                "labels": labels, "undirected": true,
                "components": {"pmi_n": round6(pmi_n), "cooc_n": round6(cooc_n), "node_strength_n": round6(ns_n)},
            })
        })
        .collect();
    out.sort_by(|a, b| {
        b["w"].as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["w"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b["cooc"].as_u64().unwrap_or(0).cmp(&a["cooc"].as_u64().unwrap_or(0)))
    });
    out.truncate(MAX_SCORED_EDGES);

    let n_in = pat_edges.len();
    let n_out = out.len();
    Ok(StageOutcome::ok_with(
        update(json!({"concept_graph": {"edges": {"edges": out}}})),
        json!({"reason": "ok", "counts": {"input_pairs": n_in, "linked_pairs": linked, "output_edges": n_out}}),
    ))
}

// ---------------------------------------------------------------- rules

fn rule_tokens(key: &str) -> BTreeSet<String> {
    canon_term(key)
        .split_whitespace()
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn set_jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Extract association, synonym, and subsumption rules from scored edges, and
/// stamp a new concept-graph version whose id hashes (parent, rules, node
/// ids, edge pairs).
pub fn extract_rules(state: &Value) -> Result<StageOutcome> {
    let nodes = get_array(state, &["concept_graph", "nodes", "nodes"])
        .cloned()
        .unwrap_or_default();
    if nodes.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_nodes",
            update(json!({"concept_graph": {"rules": {"rules": []}}})),
        ));
    }
    let edges = get_array(state, &["concept_graph", "edges", "edges"])
        .cloned()
        .unwrap_or_default();
    if edges.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_edges",
            update(json!({"concept_graph": {"rules": {"rules": []}}})),
        ));
    }

    let by_id: BTreeMap<&str, &Value> = nodes
        .iter()
        .filter_map(|n| Some((n.get("id")?.as_str()?, n)))
        .collect();

    let mut rules: Vec<Value> = Vec::new();
    let (mut c_assoc, mut c_syn, mut c_sub) = (0usize, 0usize, 0usize);

    for e in &edges {
        if rules.len() >= MAX_RULES_OUT {
            break;
        }
        let (Some(uid), Some(vid)) = (
            e.get("u").and_then(|v| v.as_str()),
            e.get("v").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let (Some(u), Some(v)) = (by_id.get(uid), by_id.get(vid)) else { continue };
        let w = e.get("w").and_then(|x| x.as_f64()).unwrap_or(0.0);
        let reward = e.get("reward_avg").and_then(|x| x.as_f64()).unwrap_or(0.0);

        if w >= THRESH_ASSOC_W {
            let pmi_n = e
                .get("components")
                .and_then(|c| c.get("pmi_n"))
                .and_then(|p| p.as_f64())
                .unwrap_or(0.0);
            let conf = (0.5 * w + 0.2 * pmi_n + 0.3 * reward).min(1.0);
            rules.push(json!({
                "type": "assoc", "u": uid, "v": vid,
                "confidence": round6(conf),
                "evidence": {
                    "edge_w": round6(w),
                    "pmi": e.get("pmi").and_then(|p| p.as_f64()).unwrap_or(0.0),
                    "cooc": e.get("cooc").and_then(|c| c.as_u64()).unwrap_or(0),
                    "labels": e.get("labels").cloned().unwrap_or_else(|| json!([])),
                    "reward_avg": round6(reward),
                },
            }));
            c_assoc += 1;
        }

        let uk = u.get("key").and_then(|k| k.as_str()).unwrap_or("");
        let vk = v.get("key").and_then(|k| k.as_str()).unwrap_or("");
        let ut = rule_tokens(uk);
        let vt = rule_tokens(vk);
        let un = u.get("n").and_then(|n| n.as_u64()).unwrap_or(0);
        let vn = v.get("n").and_then(|n| n.as_u64()).unwrap_or(0);

        let j = set_jaccard(&ut, &vt);
        if j >= THRESH_SYNONYM_JACC && w >= THRESH_SYNONYM_W_MIN && un == vn {
            rules.push(json!({
                "type": "synonym", "a": uid, "b": vid,
                "confidence": round6((0.6 * j + 0.4 * w).min(1.0)),
                "evidence": {"token_jaccard": round6(j), "edge_w": round6(w), "keys": [uk, vk]},
            }));
            c_syn += 1;
        }

        if !ut.is_empty() && !vt.is_empty() && w >= THRESH_SUBSUME_W {
            let sub = if ut.is_subset(&vt) && vn > un {
                Some((uid, vid, uk, vk, ut.len() as f64 / vt.len().max(1) as f64))
            } else if vt.is_subset(&ut) && un > vn {
                Some((vid, uid, vk, uk, vt.len() as f64 / ut.len().max(1) as f64))
            } else {
                None
            };
            if let Some((parent, child, pk, ck, overlap)) = sub {
                rules.push(json!({
                    "type": "subsumes", "parent": parent, "child": child,
                    "confidence": round6((0.5 * w + 0.5 * overlap).min(1.0)),
                    "evidence": {"edge_w": round6(w), "overlap": round6(overlap),
                                 "parent_key": pk, "child_key": ck},
                }));
                c_sub += 1;
            }
        }
    }

    let parent = get_path(state, &["concept_graph", "version", "id"])
        .and_then(|i| i.as_str())
        .map(str::to_string);
    let node_ids: Vec<&str> = {
        let mut ids: Vec<&str> = nodes
            .iter()
            .filter_map(|n| n.get("id").and_then(|i| i.as_str()))
            .collect();
        ids.sort_unstable();
        ids.truncate(120);
        ids
    };
    let edge_pairs: Vec<Value> = {
        let mut ps: Vec<(String, String)> = edges
            .iter()
            .filter_map(|e| {
                Some((
                    e.get("u")?.as_str()?.to_string(),
                    e.get("v")?.as_str()?.to_string(),
                ))
            })
            .collect();
        ps.sort();
        ps.truncate(200);
        ps.into_iter().map(|(u, v)| json!([u, v])).collect()
    };
    let version_id = content_hash(&json!({
        "parent": &parent,
        "rules": &rules,
        "node_ids": node_ids,
        "edge_pairs": edge_pairs,
    }));
    let total_rules = rules.len();

    Ok(StageOutcome::ok_with(
        update(json!({"concept_graph": {
            "rules": {"rules": rules},
            "version": {
                "id": version_id,
                "parent_id": parent,
                "counts": {"rules": total_rules, "edges": edges.len(), "nodes": nodes.len()},
            },
            "updates": {"new_rules": total_rules, "assoc": c_assoc, "synonym": c_syn, "subsumes": c_sub},
        }})),
        json!({"reason": "ok", "counts": {"assoc": c_assoc, "synonym": c_syn, "subsumes": c_sub, "total": total_rules}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::deep_merge;

    fn doc_state() -> Value {
        json!({"perception": {"packz": {
            "id": "cur", "text": "concept graph builds nodes and edges from concept patterns",
        }},
        "memory": {"corpus": [
            {"id": "d1", "text": "mining concept patterns from recent messages"},
            {"id": "d2", "text": "graph edges connect concept nodes"},
        ]}})
    }

    fn run_graph(mut state: Value) -> Value {
        for stage in [mine_patterns, manage_nodes, score_edges, extract_rules] {
            let out = stage(&state).unwrap();
            deep_merge(&mut state, Value::Object(out.update));
        }
        state
    }

    #[test]
    fn pipeline_builds_nodes_edges_rules_and_version() {
        let state = run_graph(doc_state());
        let nodes = state["concept_graph"]["nodes"]["nodes"].as_array().unwrap();
        assert!(!nodes.is_empty());
        let edges = state["concept_graph"]["edges"]["edges"].as_array().unwrap();
        assert!(!edges.is_empty());
        assert!(state["concept_graph"]["version"]["id"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn version_parent_chains_to_previous_version() {
        let first = run_graph(doc_state());
        let first_version = first["concept_graph"]["version"]["id"].clone();
        let second = run_graph(first);
        assert_eq!(
            second["concept_graph"]["version"]["parent_id"],
            first_version
        );
    }

    #[test]
    fn node_ids_hash_key_size_lang() {
        assert_eq!(node_id("concept graph", 2, "en"), node_id("concept graph", 2, "en"));
        assert_ne!(node_id("concept graph", 2, "en"), node_id("concept graph", 1, "en"));
    }

    #[test]
    fn trace_yields_intent_patterns_without_docs() {
        let state = json!({"world_model": {"trace": {"error_history": [
            {"reward": 0.8, "target": "execute_action", "actual": "execute_action", "top_pred": "ask_clarification"},
            {"reward": 0.6, "target": "ask_clarification", "actual": "direct_answer", "top_pred": "direct_answer"},
        ]}}});
        let out = mine_patterns(&state).unwrap();
        let terms = out.update["concept_graph"]["patterns"]["terms"].as_array().unwrap();
        assert!(terms.iter().any(|t| {
            t["key"].as_str().unwrap_or("").starts_with(INTENT_PREFIX)
        }));
        let edges = out.update["concept_graph"]["patterns"]["edges"].as_array().unwrap();
        assert!(!edges.is_empty());
    }

    #[test]
    fn stopwords_do_not_become_terms() {
        let state = json!({"perception": {"packz": {"id": "x", "text": "the and of to in"}}});
        let out = mine_patterns(&state).unwrap();
        let terms = out.update["concept_graph"]["patterns"]["terms"].as_array().unwrap();
        assert!(terms.is_empty());
    }
}
