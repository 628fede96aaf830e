mod addressing;
mod collect;
mod confidence;
mod normalize;
mod novelty;
mod packz;
mod script;
mod sentences;
mod speech_act;
mod tokens;

pub use addressing::addressing;
pub use collect::collect;
pub use confidence::confidence;
pub use normalize::normalize;
pub use novelty::novelty;
pub use packz::packz;
pub use script::script_tag;
pub use sentences::split_sentences;
pub use speech_act::speech_act;
pub use tokens::tokenize;

use serde_json::Value;

use cognit_types::get_str;

/// The working text for downstream perception stages: normalized text when
/// present, raw fallbacks otherwise.
pub(crate) fn input_text(state: &Value) -> Option<&str> {
    get_str(state, &["perception", "normalized_text"])
        .or_else(|| get_str(state, &["text"]))
        .or_else(|| get_str(state, &["raw_text"]))
}

/// Slice by inclusive char span, the offset unit every perception span uses.
pub(crate) fn slice_chars(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start) + 1).collect()
}

/// Single-codepoint emoji coverage shared by the tokenizer and script tagger.
pub(crate) fn tokens_is_emoji(ch: char) -> bool {
    matches!(ch as u32, 0x1F300..=0x1FAFF | 0x2700..=0x27BF | 0x2600..=0x26FF)
}
