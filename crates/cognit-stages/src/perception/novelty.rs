use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, char_ngrams, clamp01, get_array, jaccard, round3, update};

use super::input_text;

const W_UNIQ: f64 = 0.45;
const W_RED: f64 = 0.30;
const W_HIST: f64 = 0.25;
const GRAM_N: usize = 3;

fn history_texts(state: &Value) -> Vec<String> {
    let from = |path: &[&str]| -> Vec<String> {
        get_array(state, path)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let ctx = from(&["context", "recent_texts"]);
    if !ctx.is_empty() {
        return ctx;
    }
    from(&["perception", "history", "texts"])
}

fn unique_token_ratio(tokens: &[Value]) -> f64 {
    let texts: Vec<&str> = tokens
        .iter()
        .filter_map(|t| t.get("text").and_then(|v| v.as_str()))
        .collect();
    if texts.is_empty() {
        return 0.0;
    }
    let uniq: std::collections::HashSet<&&str> = texts.iter().collect();
    uniq.len() as f64 / texts.len() as f64
}

fn noise_ratio(tokens: &[Value]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
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
    noisy as f64 / tokens.len() as f64
}

fn self_redundancy(text: &str) -> f64 {
    let grams = char_ngrams(text, GRAM_N);
    if grams.is_empty() {
        return 0.0;
    }
    let uniq: std::collections::HashSet<&String> = grams.iter().collect();
    1.0 - uniq.len() as f64 / grams.len() as f64
}

fn history_similarity(text: &str, history: &[String]) -> (f64, f64, f64, usize) {
    if history.is_empty() {
        return (0.0, 0.0, 0.0, 0);
    }
    let g0 = char_ngrams(text, GRAM_N);
    let sims: Vec<f64> = history
        .iter()
        .filter(|h| !h.trim().is_empty())
        .map(|h| jaccard(&g0, &char_ngrams(h, GRAM_N)))
        .collect();
    if sims.is_empty() {
        return (0.0, 0.0, 0.0, 0);
    }
    let min = sims.iter().copied().fold(f64::INFINITY, f64::min);
    let max = sims.iter().copied().fold(0.0_f64, f64::max);
    let avg = sims.iter().sum::<f64>() / sims.len() as f64;
    (min, max, avg, sims.len())
}

/// 0..1 novelty of the current message: vocabulary diversity, self-repetition,
/// and dissimilarity against recent history texts.
pub fn novelty(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"novelty": {"score": 0.0, "breakdown": [],
                "similarity": {"history_min": 0.0, "history_max": 0.0, "history_avg": 0.0, "compared": 0},
                "signals": {}}}})),
        ));
    };

    let tokens = get_array(state, &["perception", "tokens"])
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    let history = history_texts(state);

    let uniq = unique_token_ratio(tokens);
    let noise = noise_ratio(tokens);
    let redundancy = self_redundancy(text);
    let (h_min, h_max, h_avg, compared) = history_similarity(text, &history);

    // Optimistic prior when there is no history to compare against.
    let hist_signal = if compared > 0 { 1.0 - h_max } else { 0.8 };
    let anti_redundancy = 1.0 - redundancy;

    let mut base = W_UNIQ * uniq + W_RED * anti_redundancy + W_HIST * hist_signal;
    let noise_pen = if noise > 0.6 { -0.1 } else { 0.0 };
    base += noise_pen;
    let score = clamp01(round3(base));

    Ok(StageOutcome::ok(update(json!({"perception": {"novelty": {
        "score": score,
        "breakdown": [
            {"name": "unique_token_ratio", "value": round3(uniq), "weight": W_UNIQ, "contrib": round3(W_UNIQ * uniq)},
            {"name": "anti_redundancy", "value": round3(anti_redundancy), "weight": W_RED, "contrib": round3(W_RED * anti_redundancy)},
            {"name": "history_novelty", "value": round3(hist_signal), "weight": W_HIST, "contrib": round3(W_HIST * hist_signal)},
            {"name": "noise_penalty", "value": round3(noise), "weight": noise_pen, "contrib": round3(noise_pen)},
        ],
        "similarity": {
            "history_min": round3(h_min), "history_max": round3(h_max),
            "history_avg": round3(h_avg), "compared": compared,
        },
        "signals": {
            "unique_token_ratio": round3(uniq),
            "self_redundancy": round3(redundancy),
            "noise_ratio": round3(noise),
        },
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_history_lowers_novelty() {
        let fresh = json!({"perception": {"normalized_text": "an entirely new topic appears"}});
        let rerun = json!({
            "perception": {"normalized_text": "an entirely new topic appears"},
            "context": {"recent_texts": ["an entirely new topic appears"]},
        });
        let s_fresh = novelty(&fresh).unwrap().update["perception"]["novelty"]["score"]
            .as_f64()
            .unwrap();
        let s_rerun = novelty(&rerun).unwrap().update["perception"]["novelty"]["score"]
            .as_f64()
            .unwrap();
        assert!(s_rerun < s_fresh);
    }

    #[test]
    fn self_repetition_lowers_novelty() {
        let varied = self_redundancy("the quick brown fox jumps over dogs");
        let repeated = self_redundancy("abc abc abc abc abc abc");
        assert!(repeated > varied);
    }

    #[test]
    fn similarity_stats_reported() {
        let state = json!({
            "perception": {"normalized_text": "hello world"},
            "context": {"recent_texts": ["hello world", "different text"]},
        });
        let out = novelty(&state).unwrap();
        let sim = &out.update["perception"]["novelty"]["similarity"];
        assert_eq!(sim["compared"], json!(2));
        assert_eq!(sim["history_max"], json!(1.0));
    }
}
