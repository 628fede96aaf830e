use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, content_hash, get_array, get_bool, get_f64, get_str, update};

use super::input_text;

const TOKENS_MAX: usize = 5000;
const SENTENCES_MAX: usize = 1000;
const SCRIPT_TAGS_MAX: usize = 5000;

fn take_capped(items: Option<&Vec<Value>>, cap: usize) -> (Vec<Value>, bool) {
    let items = items.cloned().unwrap_or_default();
    if items.len() <= cap {
        (items, false)
    } else {
        (items[..cap].to_vec(), true)
    }
}

fn majority_direction(tags: &[Value]) -> &'static str {
    let rtl = tags
        .iter()
        .filter(|t| t.get("dir").and_then(|d| d.as_str()) == Some("rtl"))
        .count();
    let ltr = tags
        .iter()
        .filter(|t| t.get("dir").and_then(|d| d.as_str()) == Some("ltr"))
        .count();
    if rtl > ltr { "rtl" } else { "ltr" }
}

/// Consolidate the perception layer into the canonical PackZ record. The id
/// is a hash of the normalized text plus the commit time, so identical
/// commits pack identically.
pub fn packz(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"packz": {
                "id": "", "text": "",
                "counts": {"chars": 0, "words": 0, "tokens": 0, "sentences": 0},
                "signals": {},
                "spans": {"sentences": [], "tokens": [], "script_tags": []},
                "meta": {"truncated_spans": false},
            }}})),
        ));
    };
    let text = text.to_string();

    let commit_time = get_str(state, &["perception", "meta", "commit_time"]);
    let id = content_hash(&json!({"text": text, "commit_time": commit_time}));

    let (sentences, s_cut) = take_capped(
        get_array(state, &["perception", "sentences"]),
        SENTENCES_MAX,
    );
    let (tokens, t_cut) = take_capped(get_array(state, &["perception", "tokens"]), TOKENS_MAX);
    let (tags, g_cut) = take_capped(
        get_array(state, &["perception", "script_tags"]),
        SCRIPT_TAGS_MAX,
    );
    let truncated_spans = s_cut || t_cut || g_cut;

    let signals = json!({
        "direction": majority_direction(&tags),
        "addressed_to_agent": get_bool(state, &["perception", "addressing", "is_to_agent"]).unwrap_or(false),
        "speech_act": get_str(state, &["perception", "speech_act", "top"]),
        "confidence": get_f64(state, &["perception", "confidence", "score"]).unwrap_or(0.0),
        "novelty": get_f64(state, &["perception", "novelty", "score"]).unwrap_or(0.0),
    });

    let counts = json!({
        "chars": text.chars().count(),
        "words": text.split_whitespace().count(),
        "tokens": tokens.len(),
        "sentences": sentences.len(),
    });

    Ok(StageOutcome::ok(update(json!({"perception": {"packz": {
        "id": id,
        "text": text,
        "counts": counts,
        "signals": signals,
        "spans": {"sentences": sentences, "tokens": tokens, "script_tags": tags},
        "meta": {"commit_time": commit_time, "truncated_spans": truncated_spans},
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Value {
        json!({"perception": {
            "normalized_text": "hello there",
            "meta": {"commit_time": "2026-01-01T00:00:00Z"},
            "sentences": [{"text": "hello there", "span": {"start": 0, "end": 10}}],
            "tokens": [
                {"text": "hello", "span": {"start": 0, "end": 4}, "type": "word"},
                {"text": "there", "span": {"start": 6, "end": 10}, "type": "word"},
            ],
            "script_tags": [
                {"span": {"start": 0, "end": 4}, "script": "Latin", "dir": "ltr", "confidence": 1.0},
            ],
            "addressing": {"is_to_agent": true},
            "speech_act": {"top": "greeting"},
            "confidence": {"score": 0.8},
            "novelty": {"score": 0.6},
        }})
    }

    #[test]
    fn id_is_stable_over_text_and_commit_time() {
        let a = packz(&seeded()).unwrap();
        let b = packz(&seeded()).unwrap();
        assert_eq!(
            a.update["perception"]["packz"]["id"],
            b.update["perception"]["packz"]["id"]
        );

        let mut other = seeded();
        other["perception"]["meta"]["commit_time"] = json!("2026-01-01T00:00:01Z");
        let c = packz(&other).unwrap();
        assert_ne!(
            a.update["perception"]["packz"]["id"],
            c.update["perception"]["packz"]["id"]
        );
    }

    #[test]
    fn signals_and_counts_consolidated() {
        let out = packz(&seeded()).unwrap();
        let pk = &out.update["perception"]["packz"];
        assert_eq!(pk["signals"]["addressed_to_agent"], json!(true));
        assert_eq!(pk["signals"]["speech_act"], json!("greeting"));
        assert_eq!(pk["counts"]["words"], json!(2));
        assert_eq!(pk["counts"]["tokens"], json!(2));
        assert_eq!(pk["meta"]["truncated_spans"], json!(false));
    }
}
