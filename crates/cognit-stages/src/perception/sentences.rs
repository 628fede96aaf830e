use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, update};

use super::input_text;

const SENT_END: [char; 8] = ['.', '!', '?', '؟', '…', '。', '！', '？'];
const CLOSE_QUOTES: [char; 9] = ['"', '\'', '”', '“', '’', '«', '»', ')', ']'];

// Lowercased, without the trailing dot.
const ABBREVIATIONS: [&str; 17] = [
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "no", "fig", "al", "dept",
    "est", "approx", "inc",
];

fn is_number_period(chars: &[char], i: usize) -> bool {
    i > 0
        && i + 1 < chars.len()
        && chars[i - 1].is_ascii_digit()
        && chars[i + 1].is_ascii_digit()
}

/// "..." runs and the single-codepoint ellipsis. Returns the last index of
/// the run when one is found.
fn ellipsis_end(chars: &[char], i: usize) -> Option<usize> {
    if chars[i] == '…' {
        return Some(i);
    }
    if chars[i] == '.' {
        let mut j = i;
        while j < chars.len() && chars[j] == '.' {
            j += 1;
        }
        if j - i >= 3 {
            return Some(j - 1);
        }
    }
    None
}

fn is_abbreviation(chars: &[char], i: usize) -> bool {
    if chars[i] != '.' {
        return false;
    }
    let mut j = i as isize - 1;
    while j >= 0 && CLOSE_QUOTES.contains(&chars[j as usize]) {
        j -= 1;
    }
    let end = (j + 1) as usize;
    while j >= 0 && (chars[j as usize].is_alphabetic() || chars[j as usize] == '/') {
        j -= 1;
    }
    let token: String = chars[(j + 1) as usize..end].iter().collect::<String>().to_lowercase();
    if token.is_empty() {
        return false;
    }
    // Single-letter initials like "T."
    if token.chars().count() == 1 && token.chars().all(|c| c.is_alphabetic()) {
        return true;
    }
    if ABBREVIATIONS.contains(&token.as_str()) {
        return true;
    }
    // "a.m." / "p.m."
    if (token == "a" || token == "p") && i + 2 < chars.len() && chars[i + 1] == 'm' && chars[i + 2] == '.' {
        return true;
    }
    false
}

/// Absorb trailing closing quotes/brackets into the sentence span.
fn consume_closing_quotes(chars: &[char], mut idx: usize) -> usize {
    let mut j = idx + 1;
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    while j < chars.len() && CLOSE_QUOTES.contains(&chars[j]) {
        idx = j;
        j += 1;
    }
    idx
}

fn make_item(chars: &[char], mut start: usize, mut end: usize) -> Option<Value> {
    while start <= end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end].is_whitespace() {
        end -= 1;
    }
    if start > end || chars[start].is_whitespace() {
        return None;
    }
    let text: String = chars[start..=end].iter().collect();
    Some(json!({"text": text, "span": {"start": start, "end": end}}))
}

/// Unicode-aware sentence splitting with abbreviation, decimal-number and
/// ellipsis guards. Spans are inclusive char offsets into the normalized
/// text.
pub fn split_sentences(state: &Value) -> Result<StageOutcome> {
    let Some(text) = input_text(state).filter(|t| !t.trim().is_empty()) else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"sentences": []}})),
        ));
    };

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut sentences: Vec<Value> = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < n {
        let ch = chars[i];
        if SENT_END.contains(&ch) {
            let mut end_idx = ellipsis_end(&chars, i).unwrap_or(i);

            if ch == '.' && ellipsis_end(&chars, i).is_none()
                && (is_abbreviation(&chars, i) || is_number_period(&chars, i))
            {
                i += 1;
                continue;
            }

            end_idx = consume_closing_quotes(&chars, end_idx);
            if let Some(item) = make_item(&chars, start, end_idx) {
                sentences.push(item);
            }
            i = end_idx + 1;
            while i < n && chars[i].is_whitespace() {
                i += 1;
            }
            start = i;
            continue;
        }
        i += 1;
    }

    // Tail without terminal punctuation.
    if start < n {
        if let Some(item) = make_item(&chars, start, n - 1) {
            sentences.push(item);
        }
    }

    let count = sentences.len();
    Ok(StageOutcome::ok_with(
        update(json!({"perception": {"sentences": sentences}})),
        json!({"reason": "ok", "count": count}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences_of(text: &str) -> Vec<String> {
        let state = json!({"perception": {"normalized_text": text}});
        let out = split_sentences(&state).unwrap();
        out.update["perception"]["sentences"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["text"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        assert_eq!(
            sentences_of("First one. Second one! Third?"),
            vec!["First one.", "Second one!", "Third?"]
        );
    }

    #[test]
    fn guards_abbreviations_and_decimals() {
        assert_eq!(
            sentences_of("Hi Dr. Smith. Version 3.14 is live."),
            vec!["Hi Dr. Smith.", "Version 3.14 is live."]
        );
    }

    #[test]
    fn keeps_ellipsis_together() {
        let s = sentences_of("Well... maybe. Done");
        assert_eq!(s, vec!["Well...", "maybe.", "Done"]);
    }

    #[test]
    fn spans_match_source_offsets() {
        let text = "One. Two.";
        let state = json!({"perception": {"normalized_text": text}});
        let out = split_sentences(&state).unwrap();
        let items = out.update["perception"]["sentences"].as_array().unwrap().clone();
        let sp = &items[1]["span"];
        let start = sp["start"].as_u64().unwrap() as usize;
        let end = sp["end"].as_u64().unwrap() as usize;
        assert_eq!(super::super::slice_chars(text, start, end), "Two.");
    }
}
