use std::sync::LazyLock;

use regex::Regex;

static RE_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?P<k>[^=\n;]+?)\s+(?:is|means|=)\s+(?P<v>[^=\n;]+?)\s*$").unwrap()
});
static RE_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:what\s+is|what's|who\s+is|define)\s+(?P<k>.+?)\s*\??\s*$").unwrap()
});

/// Parse `k is v` / `k means v` / `k = v` definitions out of a message.
pub fn extract_definitions(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for segment in text.split([';', '\n']) {
        if let Some(caps) = RE_DEFINITION.captures(segment) {
            let k = caps["k"].trim().to_string();
            let v = caps["v"].trim().to_string();
            if !k.is_empty() && !v.is_empty() && k.to_lowercase() != v.to_lowercase() {
                out.push((k, v));
            }
        }
    }
    out
}

/// Extract the subject of a `what is …` style question, if the message is
/// one.
pub fn extract_question_key(text: &str) -> Option<String> {
    RE_QUESTION
        .captures(text)
        .map(|caps| caps["k"].trim().to_string())
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_definitions() {
        assert_eq!(
            extract_definitions("rust is a systems language"),
            vec![("rust".to_string(), "a systems language".to_string())]
        );
        assert_eq!(
            extract_definitions("a = 1; b means two"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
            ]
        );
        assert!(extract_definitions("no facts here").is_empty());
    }

    #[test]
    fn captures_questions() {
        assert_eq!(extract_question_key("what is rust?"), Some("rust".to_string()));
        assert_eq!(extract_question_key("What's the plan"), Some("the plan".to_string()));
        assert_eq!(extract_question_key("run the build"), None);
    }

    #[test]
    fn identity_statements_are_not_facts() {
        assert!(extract_definitions("it is it").is_empty());
    }
}
