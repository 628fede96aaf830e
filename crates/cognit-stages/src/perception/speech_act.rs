use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{StageOutcome, get_array, get_bool, round3, update};

use super::{input_text, slice_chars};

use crate::common::fold;

pub const SPEECH_ACT_LABELS: [&str; 10] = [
    "request",
    "command",
    "question",
    "greeting",
    "thanks",
    "apology",
    "affirmation",
    "negation",
    "exclamation",
    "statement",
];

const GREET: [&str; 4] = ["hi", "hello", "hey", "dear"];
const THANKS: [&str; 5] = ["thanks", "thank", "thankyou", "thx", "ty"];
const APOLOGY: [&str; 3] = ["sorry", "apologies", "apologize"];
const AFFIRM: [&str; 8] = ["yes", "yeah", "yep", "ok", "okay", "sure", "roger", "yup"];
const NEG: [&str; 4] = ["no", "nope", "nah", "never"];
const REQUEST: [&str; 5] = ["please", "pls", "plz", "kindly", "help"];
const IMPERATIVE: [&str; 12] = [
    "send", "give", "say", "open", "write", "run", "check", "add", "delete", "show", "list",
    "summarize",
];
const WH: [&str; 9] = ["what", "why", "how", "when", "where", "which", "who", "whom", "whose"];
const AUX_Q: [&str; 11] = [
    "is", "are", "am", "do", "does", "did", "can", "could", "would", "will", "should",
];

fn has_question_mark(text: &str) -> bool {
    text.chars().any(|c| matches!(c, '?' | '؟' | '？'))
}

fn has_exclamation(text: &str) -> bool {
    text.contains('!') || text.contains('！')
}

fn contains_any(tokens: &[String], vocab: &[&str]) -> bool {
    tokens.iter().any(|t| vocab.contains(&fold(t).as_str()))
}

fn starts_with_any(tokens: &[String], vocab: &[&str]) -> bool {
    tokens
        .first()
        .map(|t| vocab.contains(&fold(t).as_str()))
        .unwrap_or(false)
}

fn request_modal_present(tokens: &[String], text: &str) -> bool {
    let joined = fold(&tokens.join(" "));
    if ["could you", "would you", "can you"]
        .iter()
        .any(|p| joined.contains(p))
    {
        return true;
    }
    if contains_any(tokens, &REQUEST) {
        return true;
    }
    fold(text).contains("please")
}

fn score_sentence(text: &str, tokens: &[String], addressed: bool) -> Map<String, Value> {
    let mut scores: Map<String, Value> = SPEECH_ACT_LABELS
        .iter()
        .map(|l| (l.to_string(), json!(0.0)))
        .collect();
    let mut add = |scores: &mut Map<String, Value>, label: &str, delta: f64| {
        let cur = scores.get(label).and_then(|v| v.as_f64()).unwrap_or(0.0);
        scores.insert(label.to_string(), json!((cur + delta).min(1.0)));
    };

    let has_q = has_question_mark(text);
    let has_exc = has_exclamation(text);
    let head: Vec<String> = tokens.iter().take(5).cloned().collect();

    if starts_with_any(&head, &GREET) {
        add(&mut scores, "greeting", 0.8);
    }
    if contains_any(tokens, &THANKS) {
        add(&mut scores, "thanks", 0.9);
    }
    if contains_any(tokens, &APOLOGY) {
        add(&mut scores, "apology", 0.9);
    }
    if tokens.len() <= 3 && contains_any(tokens, &AFFIRM) {
        add(&mut scores, "affirmation", 0.9);
    }
    if tokens.len() <= 3 && contains_any(tokens, &NEG) {
        add(&mut scores, "negation", 0.9);
    }

    if has_q || starts_with_any(&head, &WH) || starts_with_any(&head, &AUX_Q) {
        add(&mut scores, "question", 0.7);
    }
    if request_modal_present(&head, text) {
        add(&mut scores, "request", 0.8);
        if addressed {
            add(&mut scores, "request", 0.1);
        }
    }
    if starts_with_any(tokens, &IMPERATIVE) && !has_q {
        add(&mut scores, "command", 0.7);
        if addressed {
            add(&mut scores, "command", 0.1);
        }
    }
    if has_exc {
        let social_max = ["greeting", "thanks", "apology", "affirmation", "negation"]
            .iter()
            .map(|l| scores.get(*l).and_then(|v| v.as_f64()).unwrap_or(0.0))
            .fold(0.0_f64, f64::max);
        if social_max < 0.6 {
            add(&mut scores, "exclamation", 0.6);
        }
    }

    let any_strong = scores
        .iter()
        .filter(|(k, _)| k.as_str() != "statement")
        .any(|(_, v)| v.as_f64().unwrap_or(0.0) >= 0.5);
    if !any_strong {
        scores.insert("statement".to_string(), json!(0.6));
    }
    scores
}

fn top_of(scores: &Map<String, Value>) -> (String, f64) {
    SPEECH_ACT_LABELS
        .iter()
        .map(|l| {
            (
                l.to_string(),
                scores.get(*l).and_then(|v| v.as_f64()).unwrap_or(0.0),
            )
        })
        .fold(("statement".to_string(), -1.0), |acc, (l, s)| {
            if s > acc.1 { (l, s) } else { acc }
        })
}

/// Classify the discourse function of the message: lexicon-scored labels per
/// sentence, averaged into a global distribution with a top label and cues.
pub fn speech_act(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"speech_act": {
                "top": "statement", "scores": {}, "per_sentence": [], "cues": []
            }}})),
        ));
    };
    let text = text.to_string();
    let addressed =
        get_bool(state, &["perception", "addressing", "is_to_agent"]).unwrap_or(false);

    let sentences = get_array(state, &["perception", "sentences"])
        .cloned()
        .unwrap_or_default();

    let mut per_sentence: Vec<Value> = Vec::new();
    let mut global: Map<String, Value> = SPEECH_ACT_LABELS
        .iter()
        .map(|l| (l.to_string(), json!(0.0)))
        .collect();

    let chunks: Vec<(String, (usize, usize))> = if sentences.is_empty() {
        let end = text.chars().count().saturating_sub(1);
        vec![(text.clone(), (0, end))]
    } else {
        sentences
            .iter()
            .filter_map(|s| {
                let sp = s.get("span")?;
                let start = sp.get("start")?.as_u64()? as usize;
                let end = sp.get("end")?.as_u64()? as usize;
                Some((slice_chars(&text, start, end), (start, end)))
            })
            .collect()
    };

    for (chunk, (start, end)) in &chunks {
        let toks: Vec<String> = chunk.split_whitespace().map(str::to_string).collect();
        let scores = score_sentence(chunk, &toks, addressed);
        let (act, conf) = top_of(&scores);
        per_sentence.push(json!({
            "span": {"start": start, "end": end},
            "act": act,
            "confidence": round3(conf),
        }));
        for label in SPEECH_ACT_LABELS {
            let cur = global.get(label).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let s = scores.get(label).and_then(|v| v.as_f64()).unwrap_or(0.0);
            global.insert(label.to_string(), json!(cur + s));
        }
    }

    if !per_sentence.is_empty() {
        let n = per_sentence.len() as f64;
        for label in SPEECH_ACT_LABELS {
            let cur = global.get(label).and_then(|v| v.as_f64()).unwrap_or(0.0);
            global.insert(label.to_string(), json!(round3((cur / n).min(1.0))));
        }
    }
    let (top, _) = top_of(&global);

    let mut cues: Vec<&str> = Vec::new();
    if has_question_mark(&text) {
        cues.push("question_mark");
    }
    if has_exclamation(&text) {
        cues.push("exclamation_mark");
    }
    let all_tokens: Vec<String> = text.split_whitespace().take(5).map(str::to_string).collect();
    if request_modal_present(&all_tokens, &text) {
        cues.push("request_modal");
    }
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    if starts_with_any(&words, &IMPERATIVE) {
        cues.push("imperative_start");
    }
    if addressed {
        cues.push("addressed_to_agent");
    }

    Ok(StageOutcome::ok(update(json!({"perception": {"speech_act": {
        "top": top,
        "scores": global,
        "per_sentence": per_sentence,
        "cues": cues,
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_for(text: &str) -> String {
        let state = json!({"perception": {"normalized_text": text}});
        let out = speech_act(&state).unwrap();
        out.update["perception"]["speech_act"]["top"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn classifies_common_acts() {
        assert_eq!(top_for("what is the plan?"), "question");
        assert_eq!(top_for("please summarize the report"), "request");
        assert_eq!(top_for("run the build"), "command");
        assert_eq!(top_for("thanks a lot"), "thanks");
        assert_eq!(top_for("the sky is blue today"), "statement");
    }

    #[test]
    fn short_yes_is_affirmation() {
        assert_eq!(top_for("yes"), "affirmation");
        assert_eq!(top_for("nope"), "negation");
    }

    #[test]
    fn cues_are_recorded() {
        let state = json!({"perception": {"normalized_text": "please run it now!"}});
        let out = speech_act(&state).unwrap();
        let cues = out.update["perception"]["speech_act"]["cues"]
            .as_array()
            .unwrap()
            .clone();
        assert!(cues.contains(&json!("request_modal")));
        assert!(cues.contains(&json!("exclamation_mark")));
    }
}
