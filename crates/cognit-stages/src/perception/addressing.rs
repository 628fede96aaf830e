use anyhow::Result;
use serde_json::{Value, json};

use cognit_types::{StageOutcome, get_array, update};

use crate::common::{agent_aliases, fold};

use super::input_text;

const VOCATIVE_TRIGGERS: [&str; 4] = ["hey", "hi", "hello", "dear"];
const VOCATIVE_WINDOW: usize = 5;

fn token_texts(tokens: &[Value]) -> Vec<(String, String)> {
    tokens
        .iter()
        .filter_map(|t| {
            let text = t.get("text")?.as_str()?;
            let kind = t.get("type").and_then(|k| k.as_str()).unwrap_or("word");
            Some((text.to_string(), kind.to_string()))
        })
        .collect()
}

fn is_agent_name(s: &str, aliases: &[String]) -> bool {
    aliases.iter().any(|a| a == &fold(s))
}

/// Decide whether the message addresses the agent: explicit @mention, alias
/// token anywhere, or a greeting-plus-name vocative at the start; a raw-text
/// substring check covers corrupted token streams.
pub fn addressing(state: &Value) -> Result<StageOutcome> {
    let text = input_text(state).unwrap_or("");
    let tokens = get_array(state, &["perception", "tokens"])
        .map(|t| t.as_slice())
        .unwrap_or(&[]);

    if text.trim().is_empty() && tokens.is_empty() {
        return Ok(StageOutcome::skip_with(
            "no_content",
            update(json!({"perception": {"addressing": {
                "is_to_agent": false, "addressees": [], "mentions": [], "vocatives": []
            }}})),
        ));
    }

    let aliases = agent_aliases(state);
    let items = token_texts(tokens);

    let mentions: Vec<String> = items
        .iter()
        .filter(|(_, kind)| kind == "mention")
        .map(|(text, _)| text.trim_start_matches('@').to_string())
        .filter(|m| !m.is_empty())
        .collect();

    let name_hits: Vec<String> = items
        .iter()
        .filter(|(text, _)| is_agent_name(text, &aliases))
        .map(|(text, _)| text.clone())
        .collect();

    // Vocatives: a greeting in the leading window followed by a name, or the
    // agent name as the very first token.
    let mut vocatives: Vec<String> = Vec::new();
    let head: Vec<&String> = items
        .iter()
        .map(|(t, _)| t)
        .filter(|t| !t.trim().is_empty())
        .take(VOCATIVE_WINDOW)
        .collect();
    if let Some(first) = head.first() {
        if VOCATIVE_TRIGGERS.contains(&fold(first).as_str()) && head.len() >= 2 {
            vocatives.push(format!("{} {}", head[0], head[1]));
        }
        if is_agent_name(first, &aliases) {
            vocatives.push((*first).clone());
        }
    }

    let mut addressees: Vec<Value> = mentions
        .iter()
        .map(|m| json!({"name": m, "method": "mention"}))
        .collect();
    let mention_hits = mentions.iter().any(|m| is_agent_name(m, &aliases));
    for name in &name_hits {
        if !mention_hits {
            addressees.push(json!({"name": name, "method": "name"}));
        }
    }

    let mut is_to_agent = mention_hits || !name_hits.is_empty();
    if !is_to_agent {
        let lowered = fold(text);
        is_to_agent = aliases.iter().any(|a| lowered.contains(a.as_str()));
    }

    // Dedupe surface strings, preserving first occurrence.
    let dedupe = |items: Vec<String>| {
        let mut seen = std::collections::HashSet::new();
        items
            .into_iter()
            .filter(|it| seen.insert(fold(it)))
            .collect::<Vec<_>>()
    };
    let mentions = dedupe(mentions);
    let vocatives = dedupe(vocatives);

    let voc_hit = vocatives.iter().any(|v| {
        v.split_whitespace().any(|w| is_agent_name(w, &aliases))
    });

    Ok(StageOutcome::ok_with(
        update(json!({"perception": {"addressing": {
            "is_to_agent": is_to_agent,
            "addressees": addressees,
            "mentions": mentions,
            "vocatives": vocatives,
        }}})),
        json!({"reason": "ok", "signals": {
            "mention": mention_hits,
            "name": !name_hits.is_empty(),
            "voc": voc_hit,
        }}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(text: &str, tokens: Value) -> Value {
        json!({"perception": {"normalized_text": text, "tokens": tokens}})
    }

    #[test]
    fn mention_addresses_agent() {
        let state = state_with(
            "please check this @cognit",
            json!([
                {"text": "please", "span": {"start": 0, "end": 5}, "type": "word"},
                {"text": "@cognit", "span": {"start": 18, "end": 24}, "type": "mention"},
            ]),
        );
        let out = addressing(&state).unwrap();
        let addr = &out.update["perception"]["addressing"];
        assert_eq!(addr["is_to_agent"], json!(true));
        assert_eq!(addr["mentions"], json!(["cognit"]));
    }

    #[test]
    fn greeting_vocative_is_captured() {
        let state = state_with(
            "hey cognit run it",
            json!([
                {"text": "hey", "span": {"start": 0, "end": 2}, "type": "word"},
                {"text": "cognit", "span": {"start": 4, "end": 9}, "type": "word"},
                {"text": "run", "span": {"start": 11, "end": 13}, "type": "word"},
            ]),
        );
        let out = addressing(&state).unwrap();
        let addr = &out.update["perception"]["addressing"];
        assert_eq!(addr["is_to_agent"], json!(true));
        assert_eq!(addr["vocatives"], json!(["hey cognit"]));
    }

    #[test]
    fn unaddressed_text_is_not_to_agent() {
        let state = state_with(
            "what a nice day",
            json!([{"text": "what", "span": {"start": 0, "end": 3}, "type": "word"}]),
        );
        let out = addressing(&state).unwrap();
        assert_eq!(
            out.update["perception"]["addressing"]["is_to_agent"],
            json!(false)
        );
    }
}
