use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, get_str, update};

const MAX_CHARS: usize = 8000;

// Zero-width characters to drop; ZWNJ (U+200C) stays, it is orthographic.
const ZW_REMOVE: [char; 3] = ['\u{200B}', '\u{FEFF}', '\u{2060}'];

fn strip_zero_width(s: &str) -> String {
    s.chars().filter(|c| !ZW_REMOVE.contains(c)).collect()
}

fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

fn strip_controls(s: &str) -> String {
    s.chars()
        .map(|c| {
            if (c as u32) < 32 && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Conservative text cleanup: strip BOM and zero-width characters, unify
/// newlines, drop disallowed C0 controls, trim edges, cap length. Internal
/// spacing is preserved to keep formatting semantics intact.
pub fn normalize(state: &Value) -> Result<StageOutcome> {
    let raw = get_str(state, &["perception", "raw_text"])
        .or_else(|| get_str(state, &["text"]))
        .or_else(|| get_str(state, &["raw_text"]));
    let Some(raw) = raw else {
        return Ok(StageOutcome::skip_with(
            "no_text",
            update(json!({"perception": {"meta": {"truncated": false, "ops": []}}})),
        ));
    };

    let mut ops: Vec<&str> = Vec::new();
    let mut text = raw.to_string();

    let stripped = strip_zero_width(&text);
    if stripped != text {
        ops.push("strip_bom_zw");
        text = stripped;
    }
    let unified = normalize_newlines(&text);
    if unified != text {
        ops.push("normalize_newlines");
        text = unified;
    }
    let cleaned = strip_controls(&text);
    if cleaned != text {
        ops.push("strip_controls");
        text = cleaned;
    }
    let trimmed = text.trim().to_string();
    if trimmed != text {
        ops.push("trim");
        text = trimmed;
    }
    let mut truncated = false;
    if text.chars().count() > MAX_CHARS {
        text = text.chars().take(MAX_CHARS).collect();
        truncated = true;
        ops.push("cap");
    }

    let len_in = raw.chars().count();
    let len_out = text.chars().count();
    Ok(StageOutcome::ok_with(
        update(json!({
            "perception": {
                "normalized_text": text,
                "meta": {"truncated": truncated, "ops": ops},
            }
        })),
        json!({"reason": "ok", "len_in": len_in, "len_out": len_out}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::Status;

    #[test]
    fn strips_noise_and_records_ops() {
        let state = json!({"perception": {"raw_text": "\u{FEFF}Hello\u{200B}  \r\nWorld\u{0007}!\n"}});
        let out = normalize(&state).unwrap();
        assert_eq!(out.status, Status::Ok);
        let text = out.update["perception"]["normalized_text"].as_str().unwrap();
        assert_eq!(text, "Hello  \nWorld !");
        let ops = out.update["perception"]["meta"]["ops"].as_array().unwrap();
        assert!(ops.contains(&json!("strip_bom_zw")));
        assert!(ops.contains(&json!("normalize_newlines")));
        assert!(ops.contains(&json!("strip_controls")));
        assert!(ops.contains(&json!("trim")));
    }

    #[test]
    fn caps_long_inputs() {
        let long = "x".repeat(MAX_CHARS + 10);
        let state = json!({"perception": {"raw_text": long}});
        let out = normalize(&state).unwrap();
        assert_eq!(out.update["perception"]["meta"]["truncated"], json!(true));
        assert_eq!(
            out.update["perception"]["normalized_text"]
                .as_str()
                .unwrap()
                .chars()
                .count(),
            MAX_CHARS
        );
    }

    #[test]
    fn skips_without_text() {
        let out = normalize(&json!({})).unwrap();
        assert_eq!(out.status, Status::Skip);
    }
}
