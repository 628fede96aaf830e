use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, clamp01, get_array, get_bool, get_str, round3, update};

use super::input_text;

const W_LEN: f64 = 0.35;
const W_NOISE: f64 = 0.25;
const W_SCRIPT: f64 = 0.15;
const W_PRIOR: f64 = 0.10;
const W_ADDR: f64 = 0.05;
const TRUNC_PENALTY: f64 = -0.25;

/// Piecewise band: very short inputs score low, ~10..400 chars is the sweet
/// spot, very long inputs decay mildly.
fn length_score(n: usize) -> f64 {
    match n {
        0..=1 => 0.05,
        2..=4 => 0.15,
        5..=9 => 0.3,
        10..=200 => 0.6 + 0.4 * (n as f64 - 10.0) / 190.0,
        201..=400 => 0.95,
        401..=2000 => (0.95 - 0.25 * (n as f64 - 400.0) / 1600.0).max(0.7),
        _ => 0.6,
    }
}

fn noise_score(tokens: &[Value]) -> (f64, f64) {
    if tokens.is_empty() {
        return (0.5, 0.5);
    }
    let noisy = tokens
        .iter()
        .filter(|t| {
            matches!(
                t.get("type").and_then(|k| k.as_str()),
                Some("punct") | Some("symbol") | Some("emoji")
            )
        })
        .count();
    let ratio = noisy as f64 / tokens.len() as f64;
    (clamp01(1.0 - (ratio * 1.333).min(0.8)), ratio)
}

fn script_consistency(tags: &[Value]) -> f64 {
    if tags.is_empty() {
        return 0.7;
    }
    let mut counts = std::collections::HashMap::new();
    for t in tags {
        if let Some(sc) = t.get("script").and_then(|s| s.as_str()) {
            *counts.entry(sc.to_string()).or_insert(0usize) += 1;
        }
    }
    let total: usize = counts.values().sum::<usize>().max(1);
    let major = counts.values().copied().max().unwrap_or(0);
    let mut base = 0.4 + 0.6 * (major as f64 / total as f64);
    if counts.contains_key("Mixed") {
        base -= 0.15;
    }
    clamp01(base)
}

fn speech_act_prior(label: Option<&str>) -> f64 {
    match label {
        Some("request") => 0.15,
        Some("command") => 0.12,
        Some("question") => 0.1,
        Some("statement") => 0.05,
        Some("thanks") | Some("affirmation") | Some("negation") => 0.03,
        Some("apology") | Some("greeting") => 0.02,
        _ => 0.0,
    }
}

/// 0..1 suitability of the perceived message for downstream processing, with
/// an interpretable breakdown.
pub fn confidence(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"confidence": {"score": 0.0, "breakdown": [], "flags": []}}})),
        ));
    };

    let tokens = get_array(state, &["perception", "tokens"])
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    let tags = get_array(state, &["perception", "script_tags"])
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    let truncated = get_bool(state, &["perception", "meta", "truncated"]).unwrap_or(false);
    let addressed =
        get_bool(state, &["perception", "addressing", "is_to_agent"]).unwrap_or(false);
    let sa_top = get_str(state, &["perception", "speech_act", "top"]);

    let len_signal = length_score(text.chars().count());
    let (noise_signal, noise_ratio) = noise_score(tokens);
    let script_signal = script_consistency(tags);
    let prior = speech_act_prior(sa_top);
    let addr_bonus = if addressed { 0.05 } else { 0.0 };
    let trunc = if truncated { TRUNC_PENALTY } else { 0.0 };

    let base = W_LEN * len_signal
        + W_NOISE * noise_signal
        + W_SCRIPT * script_signal
        + W_PRIOR * (0.5 + prior)
        + W_ADDR * (0.5 + addr_bonus);
    let score = clamp01(round3(base + trunc));

    let mut flags: Vec<&str> = Vec::new();
    if truncated {
        flags.push("truncated_input");
    }
    if noise_ratio > 0.5 {
        flags.push("high_token_noise");
    }
    let script_kinds = tags
        .iter()
        .filter_map(|t| t.get("script").and_then(|s| s.as_str()))
        .collect::<std::collections::HashSet<_>>();
    if script_kinds.contains("Mixed") || script_kinds.len() > 2 {
        flags.push("script_mixed");
    }

    let breakdown = json!([
        {"name": "length", "value": round3(len_signal), "weight": W_LEN, "contrib": round3(W_LEN * len_signal)},
        {"name": "noise", "value": round3(noise_signal), "weight": W_NOISE, "contrib": round3(W_NOISE * noise_signal)},
        {"name": "script_consistency", "value": round3(script_signal), "weight": W_SCRIPT, "contrib": round3(W_SCRIPT * script_signal)},
        {"name": "speech_act_prior", "value": round3(0.5 + prior), "weight": W_PRIOR, "contrib": round3(W_PRIOR * (0.5 + prior))},
        {"name": "addressing", "value": round3(0.5 + addr_bonus), "weight": W_ADDR, "contrib": round3(W_ADDR * (0.5 + addr_bonus))},
        {"name": "truncation_penalty", "value": if truncated {1.0} else {0.0}, "weight": TRUNC_PENALTY, "contrib": round3(trunc)},
    ]);

    Ok(StageOutcome::ok(update(json!({"perception": {"confidence": {
        "score": score,
        "breakdown": breakdown,
        "flags": flags,
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasonable_message_scores_high() {
        let state = json!({"perception": {
            "normalized_text": "please summarize the weekly report for the team",
            "speech_act": {"top": "request"},
            "addressing": {"is_to_agent": true},
        }});
        let out = confidence(&state).unwrap();
        let score = out.update["perception"]["confidence"]["score"].as_f64().unwrap();
        assert!(score > 0.6, "score was {score}");
    }

    #[test]
    fn truncation_penalizes() {
        let base = json!({"perception": {"normalized_text": "some reasonable message here"}});
        let cut = json!({"perception": {
            "normalized_text": "some reasonable message here",
            "meta": {"truncated": true},
        }});
        let s1 = confidence(&base).unwrap().update["perception"]["confidence"]["score"]
            .as_f64()
            .unwrap();
        let s2 = confidence(&cut).unwrap().update["perception"]["confidence"]["score"]
            .as_f64()
            .unwrap();
        assert!(s2 < s1);
    }

    #[test]
    fn noisy_tokens_flagged() {
        let toks: Vec<Value> = (0..10)
            .map(|i| json!({"text": "!", "span": {"start": i, "end": i}, "type": "punct"}))
            .collect();
        let state = json!({"perception": {"normalized_text": "!!!!!!!!!!", "tokens": toks}});
        let out = confidence(&state).unwrap();
        let flags = out.update["perception"]["confidence"]["flags"].as_array().unwrap().clone();
        assert!(flags.contains(&json!("high_token_noise")));
    }
}
