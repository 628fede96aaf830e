use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, get_array, update};

use super::{input_text, slice_chars};

static RE_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+").unwrap());
static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:https?://|www\.)\S+").unwrap());
static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static RE_HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\w+").unwrap());
static RE_MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^@\w+").unwrap());
static RE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.,]\d+)*(?:%|[A-Za-z])?").unwrap());
static RE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\W\d_]+(?:['’\-][^\W\d_]+)*").unwrap());
static RE_EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\u{1F300}-\u{1FAFF}\u{2700}-\u{27BF}\u{2600}-\u{26FF}]").unwrap()
});

fn is_punct(ch: char) -> bool {
    ch.is_ascii_punctuation()
        || matches!(
            ch,
            '«' | '»'
                | '…'
                | '—'
                | '–'
                | '،'
                | '؛'
                | '؟'
                | '“'
                | '”'
                | '‘'
                | '’'
                | '。'
                | '、'
                | '！'
                | '？'
                | '「'
                | '」'
        )
}

fn push_token(out: &mut Vec<Value>, text: &str, start: usize, end: usize, kind: &str) {
    out.push(json!({"text": text, "span": {"start": start, "end": end}, "type": kind}));
}

/// Scan one text segment; `base` is the char offset of the segment within the
/// full text, so emitted spans stay global.
fn scan_tokens(txt: &str, base: usize, out: &mut Vec<Value>) {
    let recognizers: [(&str, &Regex); 7] = [
        ("url", &RE_URL),
        ("email", &RE_EMAIL),
        ("hashtag", &RE_HASHTAG),
        ("mention", &RE_MENTION),
        ("number", &RE_NUMBER),
        ("emoji", &RE_EMOJI),
        ("word", &RE_WORD),
    ];

    let mut byte = 0usize;
    let mut at = 0usize; // char offset within the segment
    while byte < txt.len() {
        let seg = &txt[byte..];
        if let Some(m) = RE_WS.find(seg) {
            byte += m.end();
            at += m.as_str().chars().count();
            continue;
        }

        let mut matched = false;
        for (label, re) in recognizers {
            if let Some(m) = re.find(seg) {
                let s = m.as_str();
                let n = s.chars().count();
                push_token(out, s, base + at, base + at + n - 1, label);
                byte += m.end();
                at += n;
                matched = true;
                break;
            }
        }
        if matched {
            continue;
        }

        let ch = seg.chars().next().expect("segment is non-empty");
        let kind = if is_punct(ch) { "punct" } else { "symbol" };
        push_token(out, &ch.to_string(), base + at, base + at, kind);
        byte += ch.len_utf8();
        at += 1;
    }
}

/// Priority-ordered token recognition (url, email, hashtag, mention, number,
/// emoji, word), applied per sentence when sentence spans exist so token
/// spans stay aligned to the full text.
pub fn tokenize(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"tokens": []}})),
        ));
    };
    let text = text.to_string();

    let mut tokens: Vec<Value> = Vec::new();
    let sentences = get_array(state, &["perception", "sentences"]);
    match sentences {
        Some(sents) if !sents.is_empty() => {
            for s in sents {
                let Some(span) = s.get("span") else { continue };
                let (Some(start), Some(end)) = (
                    span.get("start").and_then(|v| v.as_u64()),
                    span.get("end").and_then(|v| v.as_u64()),
                ) else {
                    continue;
                };
                let chunk = slice_chars(&text, start as usize, end as usize);
                scan_tokens(&chunk, start as usize, &mut tokens);
            }
        }
        _ => scan_tokens(&text, 0, &mut tokens),
    }

    let count = tokens.len();
    Ok(StageOutcome::ok_with(
        update(json!({"perception": {"tokens": tokens}})),
        json!({"reason": "ok", "count": count}),
    ))
}
