use anyhow::Result;
use serde_json::{Map, Value, json};

use cognit_types::{StageOutcome, get_array, round4, update};

use super::tokens_is_emoji;

const LATIN: [(u32, u32); 4] = [(0x0041, 0x005A), (0x0061, 0x007A), (0x00C0, 0x024F), (0x1E00, 0x1EFF)];
const ARABIC: [(u32, u32); 5] = [
    (0x0600, 0x06FF),
    (0x0750, 0x077F),
    (0x08A0, 0x08FF),
    (0xFB50, 0xFDFF),
    (0xFE70, 0xFEFF),
];
const CYRILLIC: [(u32, u32); 2] = [(0x0400, 0x04FF), (0x0500, 0x052F)];
const GREEK: [(u32, u32); 1] = [(0x0370, 0x03FF)];
const HEBREW: [(u32, u32); 1] = [(0x0590, 0x05FF)];
const DEVANAGARI: [(u32, u32); 1] = [(0x0900, 0x097F)];
const HAN: [(u32, u32); 2] = [(0x4E00, 0x9FFF), (0x3400, 0x4DBF)];
const HIRAGANA: [(u32, u32); 1] = [(0x3040, 0x309F)];
const KATAKANA: [(u32, u32); 1] = [(0x30A0, 0x30FF)];
const HANGUL: [(u32, u32); 1] = [(0xAC00, 0xD7AF)];

fn in_ranges(cp: u32, ranges: &[(u32, u32)]) -> bool {
    ranges.iter().any(|(a, b)| (*a..=*b).contains(&cp))
}

fn char_script(ch: char) -> &'static str {
    if tokens_is_emoji(ch) {
        return "Emoji";
    }
    if ch.is_ascii_digit() {
        return "Number";
    }
    if ch.is_whitespace() || ch.is_ascii_punctuation() {
        return "Common";
    }
    let cp = ch as u32;
    if in_ranges(cp, &ARABIC) {
        "Arabic"
    } else if in_ranges(cp, &LATIN) {
        "Latin"
    } else if in_ranges(cp, &CYRILLIC) {
        "Cyrillic"
    } else if in_ranges(cp, &GREEK) {
        "Greek"
    } else if in_ranges(cp, &HEBREW) {
        "Hebrew"
    } else if in_ranges(cp, &DEVANAGARI) {
        "Devanagari"
    } else if in_ranges(cp, &HAN) {
        "Han"
    } else if in_ranges(cp, &HIRAGANA) {
        "Hiragana"
    } else if in_ranges(cp, &KATAKANA) {
        "Katakana"
    } else if in_ranges(cp, &HANGUL) {
        "Hangul"
    } else if !ch.is_alphanumeric() {
        "Common"
    } else {
        "Other"
    }
}

/// Majority script of a token; mixed-script tokens report `Mixed` with the
/// majority ratio as confidence.
fn token_script(text: &str) -> (&'static str, f64) {
    let mut counts: Map<String, Value> = Map::new();
    let mut letters = 0usize;
    for ch in text.chars() {
        let sc = char_script(ch);
        if matches!(sc, "Common" | "Number" | "Emoji" | "Other") {
            continue;
        }
        let n = counts.get(sc).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        counts.insert(sc.to_string(), json!(n));
        letters += 1;
    }
    if letters == 0 {
        return ("Common", 1.0);
    }
    let (major, major_n) = counts
        .iter()
        .map(|(k, v)| (k.clone(), v.as_u64().unwrap_or(0)))
        .max_by_key(|(_, n)| *n)
        .expect("letters imply a script");
    let conf = major_n as f64 / letters as f64;
    if counts.len() > 1 {
        return ("Mixed", conf);
    }
    // Re-borrow as 'static via the known script names.
    let name = match major.as_str() {
        "Arabic" => "Arabic",
        "Latin" => "Latin",
        "Cyrillic" => "Cyrillic",
        "Greek" => "Greek",
        "Hebrew" => "Hebrew",
        "Devanagari" => "Devanagari",
        "Han" => "Han",
        "Hiragana" => "Hiragana",
        "Katakana" => "Katakana",
        "Hangul" => "Hangul",
        _ => "Other",
    };
    (name, conf)
}

fn lang_hint(script: &str) -> &'static str {
    match script {
        "Arabic" => "ar",
        "Latin" => "en",
        _ => "und",
    }
}

fn direction(script: &str) -> &'static str {
    if script == "Arabic" || script == "Hebrew" {
        "rtl"
    } else {
        "ltr"
    }
}

/// Tag each token with its dominant script, writing direction, and a crude
/// language hint.
pub fn script_tag(state: &Value) -> Result<StageOutcome> {
    let tokens = get_array(state, &["perception", "tokens"]);
    let Some(tokens) = tokens.filter(|t| !t.is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_tokens",
            update(json!({"perception": {"script_tags": []}})),
        ));
    };

    let mut tags: Vec<Value> = Vec::new();
    let mut dist: Map<String, Value> = Map::new();

    for t in tokens {
        let (Some(text), Some(span)) = (t.get("text").and_then(|v| v.as_str()), t.get("span"))
        else {
            continue;
        };
        let (script, conf) = token_script(text);
        let entry = dist.get(script).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        dist.insert(script.to_string(), json!(entry));
        let effective = if script == "Mixed" { "Other" } else { script };
        tags.push(json!({
            "span": span,
            "script": script,
            "dir": direction(effective),
            "lang_hint": lang_hint(effective),
            "confidence": round4(conf),
        }));
    }

    Ok(StageOutcome::ok_with(
        update(json!({"perception": {"script_tags": tags}})),
        json!({"reason": "ok", "distribution": dist}),
    ))
}
