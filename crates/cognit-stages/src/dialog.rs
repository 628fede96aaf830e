use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde_json::{Map, Value, json};

use cognit_types::{
    Move, StageOutcome, get_array, get_bool, get_f64, get_i64, get_path, get_str,
    truncate_chars, update,
};

const SURFACE_MAX_LEN: usize = 800;
const SAFETY_MAX_LEN: usize = 1200;

// ---------------------------------------------------------------- realize

fn join_questions(questions: &[Value]) -> String {
    let texts: Vec<&str> = questions
        .iter()
        .filter_map(|q| q.get("text").and_then(|t| t.as_str()))
        .collect();
    match texts.len() {
        0 => String::new(),
        1 => texts[0].to_string(),
        _ => texts
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {t}", i + 1))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn confirm_text(plan: &Value, skill_name: &str, filled: &Map<String, Value>) -> String {
    if let Some(summary) = plan.get("dry_run_summary").and_then(|s| s.as_str()) {
        if !summary.is_empty() {
            return summary.to_string();
        }
    }
    let mut keys: Vec<&String> = filled.keys().collect();
    keys.sort();
    let kv = keys
        .iter()
        .map(|k| format!("{k}={}", render_value(&filled[k.as_str()])))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Confirm to run '{skill_name}' with {kv}?")
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pick_step<'a>(steps: &'a [Value], op: &str) -> Option<&'a Value> {
    steps
        .iter()
        .find(|s| s.get("op").and_then(|o| o.as_str()) == Some(op))
}

/// Turn the plan into a dialog turn: a move, user-facing content, and (for
/// execution) the skill ops. Safety-required plans downgrade to confirm.
pub fn realize_turn(state: &Value) -> Result<StageOutcome> {
    let Some(plan) = get_path(state, &["planner", "plan"])
        .filter(|p| p.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_plan"));
    };

    let steps = plan.get("steps").and_then(|s| s.as_array()).cloned().unwrap_or_default();
    let next_move = plan.get("next_move").and_then(|m| m.as_str()).unwrap_or("");
    let questions = get_array(state, &["planner", "slot_collect", "questions"])
        .cloned()
        .unwrap_or_default();
    let filled = get_path(state, &["planner", "slot_collect", "filled"])
        .and_then(|f| f.as_object())
        .cloned()
        .unwrap_or_default();
    let must_confirm = get_bool(state, &["planner", "plan", "guardrails", "must_confirm"])
        .unwrap_or(false);
    let safecheck_needed = get_bool(
        state,
        &["world_model", "prediction", "hints", "safecheck_needed"],
    )
    .unwrap_or(false);

    let safety_required = must_confirm || safecheck_needed;
    let safety_reason = if safecheck_needed {
        Some("safecheck_needed")
    } else if must_confirm {
        Some("must_confirm")
    } else {
        None
    };
    let skill_name = plan
        .get("skill_name")
        .and_then(|s| s.as_str())
        .or_else(|| get_str(state, &["planner", "intent", "skill_name"]))
        .unwrap_or("Skill");

    let mut turn = json!({
        "move": "",
        "content": "",
        "ops": [],
        "safety": {"required": safety_required, "reason": safety_reason},
        "meta": {"plan_id": plan.get("id")},
    });

    match next_move {
        "ask_user" => {
            let mut text = join_questions(&questions);
            if text.is_empty() {
                let missing = get_array(state, &["planner", "slot_collect", "missing"])
                    .cloned()
                    .unwrap_or_default();
                text = if missing.is_empty() {
                    "Could you share the missing details so I can continue?".to_string()
                } else {
                    missing
                        .iter()
                        .enumerate()
                        .filter_map(|(i, m)| {
                            Some(format!("{}. Could you provide '{}'?", i + 1, m.as_str()?))
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                };
            }
            turn["move"] = json!("ask");
            turn["content"] = json!(text);
        }
        "confirm" => {
            turn["move"] = json!("confirm");
            turn["content"] = json!(confirm_text(plan, skill_name, &filled));
            // Keep the pending ops so the runner can dispatch after approval.
            if let Some(step) = pick_step(&steps, "execute_skill") {
                turn["ops"] = json!([{
                    "op": "execute_skill",
                    "skill_id": step.get("skill_id"),
                    "skill_name": step.get("skill_name"),
                    "params": step.get("params").cloned().unwrap_or_else(|| json!({})),
                }]);
            }
        }
        "execute" => match pick_step(&steps, "execute_skill") {
            None => {
                turn["move"] = json!("ack");
                turn["content"] = json!("The plan has no executable step; acknowledged.");
            }
            Some(step) => {
                let op = json!({
                    "op": "execute_skill",
                    "skill_id": step.get("skill_id"),
                    "skill_name": step.get("skill_name"),
                    "params": step.get("params").cloned().unwrap_or_else(|| json!({})),
                });
                if safety_required {
                    turn["move"] = json!("confirm");
                    turn["content"] = json!(confirm_text(plan, skill_name, &filled));
                } else {
                    turn["move"] = json!("execute");
                    let params = step
                        .get("params")
                        .and_then(|p| p.as_object())
                        .cloned()
                        .unwrap_or_default();
                    let mut keys: Vec<&String> = params.keys().collect();
                    keys.sort();
                    let kv = keys
                        .iter()
                        .map(|k| format!("{k}={}", render_value(&params[k.as_str()])))
                        .collect::<Vec<_>>()
                        .join(", ");
                    turn["content"] = json!(format!(
                        "Running '{}' with {kv}",
                        step.get("skill_name").and_then(|s| s.as_str()).unwrap_or("Skill")
                    ));
                }
                turn["ops"] = json!([op]);
            }
        },
        "answer" => {
            let hint = pick_step(&steps, "generate_answer")
                .and_then(|s| s.get("hint"))
                .and_then(|h| h.as_str())
                .unwrap_or("");
            if safety_required {
                turn["move"] = json!("confirm");
                turn["content"] = json!("Confirm sending the drafted answer?");
            } else {
                turn["move"] = json!("answer");
                let body = if hint.is_empty() {
                    "Here is what I have from the current context.".to_string()
                } else {
                    format!("Here is what I have on: {hint}")
                };
                turn["content"] = json!(body);
            }
        }
        "ack" => {
            turn["move"] = json!("ack");
            turn["content"] = json!("Okay.");
        }
        _ => {
            turn["move"] = json!("refuse");
            turn["content"] = json!("I could not produce a next step for that.");
        }
    }

    Ok(StageOutcome::ok(update(json!({"dialog": {"turn": turn}}))))
}

// ---------------------------------------------------------------- surface

fn bullets(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= 1 {
        return text.to_string();
    }
    lines
        .iter()
        .map(|l| format!("• {}", l.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_spaces(text: &str) -> String {
    static RE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
    static RE_EDGES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" *\n *").unwrap());
    let collapsed = RE_RUNS.replace_all(text, " ");
    RE_EDGES.replace_all(&collapsed, "\n").trim().to_string()
}

fn hedge(text: &str, confidence: f64) -> String {
    if confidence >= 0.45 || text.is_empty() {
        return text.to_string();
    }
    const PREFIX: &str = "I might be mistaken, but ";
    if text.to_lowercase().starts_with(&PREFIX.to_lowercase()) {
        return text.to_string();
    }
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => format!("{PREFIX}{}{}", first.to_lowercase(), chars.as_str()),
        None => text.to_string(),
    }
}

/// Render the realized turn into outgoing surface text: bulleting for
/// multi-question asks, cleanup, low-confidence hedging, and a length cap
/// taken from the active runtime config when present.
pub fn surface(state: &Value) -> Result<StageOutcome> {
    let Some(turn) = get_path(state, &["dialog", "turn"])
        .filter(|t| t.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_turn"));
    };

    let mv = turn.get("move").and_then(|m| m.as_str()).unwrap_or("");
    let content = turn.get("content").and_then(|c| c.as_str()).unwrap_or("");
    let filled = get_path(state, &["planner", "slot_collect", "filled"])
        .and_then(|f| f.as_object())
        .cloned()
        .unwrap_or_default();
    let confidence = get_f64(state, &["adaptation", "policy", "confidence"]).unwrap_or(0.6);
    let max_len = get_i64(state, &["runtime", "config", "dialog", "surface", "max_len"])
        .map(|n| n.max(80) as usize)
        .unwrap_or(SURFACE_MAX_LEN);

    let mut text = match mv {
        "ask" => bullets(if content.is_empty() {
            "Could you share the missing details?"
        } else {
            content
        }),
        "confirm" => {
            if content.is_empty() {
                let mut keys: Vec<&String> = filled.keys().collect();
                keys.sort();
                let kv = keys
                    .iter()
                    .map(|k| format!("{k}={}", render_value(&filled[k.as_str()])))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Confirm to proceed with {kv}?")
            } else {
                bullets(content)
            }
        }
        "answer" => {
            if content.is_empty() {
                "Got it.".to_string()
            } else {
                content.to_string()
            }
        }
        "ack" => {
            if content.is_empty() {
                "Okay.".to_string()
            } else {
                content.to_string()
            }
        }
        "refuse" => {
            if content.is_empty() {
                "I can't help with that.".to_string()
            } else {
                content.to_string()
            }
        }
        "execute" => {
            if content.is_empty() {
                "Running the action...".to_string()
            } else {
                content.to_string()
            }
        }
        _ => {
            if content.is_empty() {
                "Okay.".to_string()
            } else {
                content.to_string()
            }
        }
    };
    text = clean_spaces(&text);
    text = hedge(&text, confidence);
    text = truncate_chars(&text, max_len);

    Ok(StageOutcome::ok(update(json!({"dialog": {"surface": {
        "text": text,
        "language": "en",
        "move": mv,
        "meta": {"confidence": confidence, "max_len": max_len},
    }}}))))
}

// ---------------------------------------------------------------- safety

static RE_EMAIL_S: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b").unwrap()
});
static RE_URL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[?&](?:token|key|api[_\-]?key|access[_\-]?token)=[^&\s]+").unwrap()
});
static RE_POSSIBLE_CC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ \-]?){13,19}\b").unwrap());
static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\+?\d{1,3}[ \-]\(?\d{2,4}\)?[ \-]\d{3,4}[ \-]?\d{3,4}\b").unwrap()
});
static RE_API_KEYS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\bsk-[A-Za-z0-9]{10,}\b").unwrap(),
        Regex::new(r"\bghp_[A-Za-z0-9]{36}\b").unwrap(),
        Regex::new(r"\bAIza[0-9A-Za-z\-_]{35}\b").unwrap(),
        Regex::new(r"\bxox[abpr]-[A-Za-z0-9\-]{10,}\b").unwrap(),
    ]
});

fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let mut sum = 0u32;
    let mut alternate = false;
    for d in digits.iter().rev() {
        let mut d = *d;
        if alternate {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        alternate = !alternate;
    }
    sum % 10 == 0
}

struct Redaction {
    text: String,
    redactions: Vec<Value>,
    blocked: bool,
}

fn redact(text: &str) -> Redaction {
    let mut out = text.to_string();
    let mut redactions: Vec<Value> = Vec::new();
    let mut blocked = false;

    let emails = RE_EMAIL_S.find_iter(&out).count();
    if emails > 0 {
        out = RE_EMAIL_S.replace_all(&out, "[REDACTED_EMAIL]").to_string();
        redactions.push(json!({"type": "email", "count": emails}));
    }

    let tokens = RE_URL_TOKEN.find_iter(&out).count();
    if tokens > 0 {
        out = RE_URL_TOKEN
            .replace_all(&out, |caps: &regex::Captures| {
                let whole = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                match whole.split_once('=') {
                    Some((key, _)) => format!("{key}=[REDACTED]"),
                    None => "[REDACTED]".to_string(),
                }
            })
            .to_string();
        redactions.push(json!({"type": "url_token", "count": tokens}));
    }

    let mut api_hits = 0usize;
    for re in RE_API_KEYS.iter() {
        let hits = re.find_iter(&out).count();
        if hits > 0 {
            api_hits += hits;
            out = re.replace_all(&out, "[REDACTED_SECRET]").to_string();
        }
    }
    if api_hits > 0 {
        redactions.push(json!({"type": "api_key", "count": api_hits}));
        blocked = true;
    }

    let mut cc_hits = 0usize;
    out = RE_POSSIBLE_CC
        .replace_all(&out, |caps: &regex::Captures| {
            let s = caps.get(0).map(|m| m.as_str()).unwrap_or("");
            if luhn_valid(s) {
                cc_hits += 1;
                "[REDACTED_CARD]".to_string()
            } else {
                s.to_string()
            }
        })
        .to_string();
    if cc_hits > 0 {
        redactions.push(json!({"type": "credit_card", "count": cc_hits}));
        blocked = true;
    }

    let phones = RE_PHONE.find_iter(&out).count();
    if phones > 0 {
        out = RE_PHONE.replace_all(&out, "[REDACTED_PHONE]").to_string();
        redactions.push(json!({"type": "phone", "count": phones}));
    }

    Redaction {
        text: out,
        redactions,
        blocked,
    }
}

/// The final gate before anything leaves the system: redact sensitive
/// content, convert blocked or must-confirm messages into a confirm move.
/// `blocked == true` always implies the final move is not `execute`.
pub fn safety_filter(state: &Value) -> Result<StageOutcome> {
    let Some(surf) = get_path(state, &["dialog", "surface"])
        .filter(|s| s.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_surface"));
    };

    let mv = surf.get("move").and_then(|m| m.as_str()).unwrap_or("");
    let text = surf.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let must_confirm =
        get_bool(state, &["planner", "plan", "guardrails", "must_confirm"]).unwrap_or(false);
    let dry_summary = get_str(state, &["planner", "plan", "dry_run_summary"]).unwrap_or("");
    let max_len = get_i64(state, &["runtime", "config", "safety_filter", "max_out_len"])
        .map(|n| n.max(160) as usize)
        .unwrap_or(SAFETY_MAX_LEN);

    let red = redact(text);
    let red_text = truncate_chars(&red.text, max_len);

    let (final_move, final_text, reason) = if red.blocked {
        let preview = if red_text.is_empty() { dry_summary } else { &red_text };
        (
            "confirm",
            format!(
                "The message contained sensitive data and was redacted.\nConfirm sending the sanitized version?\n\nPreview:\n{}",
                truncate_chars(preview, max_len)
            ),
            Some("secret_detected"),
        )
    } else if must_confirm
        && matches!(
            Move::parse(mv),
            Some(Move::Answer | Move::Ack | Move::Execute)
        )
    {
        let text = if dry_summary.is_empty() {
            "Confirm to send?".to_string()
        } else {
            dry_summary.to_string()
        };
        ("confirm", text, Some("must_confirm"))
    } else {
        (mv, red_text.clone(), None)
    };

    Ok(StageOutcome::ok(update(json!({"dialog": {"final": {
        "move": final_move,
        "text": final_text,
        "redactions": red.redactions,
        "blocked": red.blocked,
        "reason": reason,
    }}}))))
}
