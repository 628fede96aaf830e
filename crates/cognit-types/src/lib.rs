mod envelope;
mod hash;
mod merge;
mod path;
mod util;

use serde::{Deserialize, Serialize};

pub use envelope::*;
pub use hash::*;
pub use merge::*;
pub use path::*;
pub use util::*;

/// Discrete class of an outgoing dialog turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    Ask,
    Confirm,
    Answer,
    Ack,
    Refuse,
    Execute,
}

impl Move {
    pub fn as_str(&self) -> &'static str {
        match self {
            Move::Ask => "ask",
            Move::Confirm => "confirm",
            Move::Answer => "answer",
            Move::Ack => "ack",
            Move::Refuse => "refuse",
            Move::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Move> {
        match s {
            "ask" => Some(Move::Ask),
            "confirm" => Some(Move::Confirm),
            "answer" => Some(Move::Answer),
            "ack" => Some(Move::Ack),
            "refuse" => Some(Move::Refuse),
            "execute" => Some(Move::Execute),
            _ => None,
        }
    }
}

/// Expected-reply label set used by the world model and the adaptation layer.
pub const REPLY_LABELS: [&str; 8] = [
    "direct_answer",
    "execute_action",
    "ask_clarification",
    "acknowledge_only",
    "small_talk",
    "closing",
    "refuse_or_safecheck",
    "other",
];
