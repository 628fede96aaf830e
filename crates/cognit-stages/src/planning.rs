use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde_json::{Map, Value, json};

use cognit_types::{
    StageOutcome, content_hash, get_array, get_bool, get_f64, get_object, get_path, get_str,
    round3, round6, update,
};

use crate::common::fold;

static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.\-]+@[\w.\-]+\.\w+").unwrap());
static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\b").unwrap());
static RE_FILEPATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/[^\s]+|[A-Za-z]:\\[^\s]+)").unwrap());

/// The built-in skill manifest used when the state carries none: the minimum
/// set of moves the dialog layer can realize.
fn default_manifest() -> Vec<Value> {
    vec![
        json!({
            "id": "skill.answer",
            "name": "Answer Generation",
            "triggers": {"reply": ["direct_answer"], "speech_act": ["question", "statement"]},
            "slots": [],
        }),
        json!({
            "id": "skill.execute",
            "name": "Action Executor",
            "triggers": {"reply": ["execute_action"], "speech_act": ["request", "command"]},
            "slots": [{"name": "action", "required": true}, {"name": "object", "required": false}],
        }),
        json!({
            "id": "skill.clarify",
            "name": "Clarification",
            "triggers": {"reply": ["ask_clarification"]},
            "slots": [{"name": "missing_info", "required": true}],
        }),
        json!({
            "id": "skill.ack",
            "name": "Acknowledge",
            "triggers": {"reply": ["acknowledge_only", "small_talk", "closing"]},
            "slots": [],
        }),
        json!({
            "id": "skill.safecheck",
            "name": "Safety Check",
            "triggers": {"reply": ["refuse_or_safecheck"]},
            "slots": [{"name": "reason", "required": true}],
        }),
    ]
}

fn packz_text(state: &Value) -> String {
    get_str(state, &["perception", "packz", "text"])
        .or_else(|| get_str(state, &["perception", "normalized_text"]))
        .or_else(|| get_str(state, &["text"]))
        .unwrap_or("")
        .to_string()
}

fn entities(state: &Value) -> Vec<Value> {
    get_array(state, &["perception", "entities"])
        .or_else(|| get_array(state, &["entities"]))
        .cloned()
        .unwrap_or_default()
}

fn entity_fill(slot: &str, entities: &[Value]) -> Option<String> {
    let name = fold(slot);
    for e in entities {
        let etype = e
            .get("type")
            .or_else(|| e.get("label"))
            .and_then(|t| t.as_str())
            .map(fold)
            .unwrap_or_default();
        let ename = e.get("name").and_then(|n| n.as_str()).map(fold).unwrap_or_default();
        if etype == name || ename == name {
            let val = e
                .get("value")
                .or_else(|| e.get("text"))
                .or_else(|| e.get("name"))?;
            return match val {
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
        }
    }
    None
}

fn text_fill(slot: &str, text: &str) -> Option<String> {
    match fold(slot).as_str() {
        "url" | "link" => RE_URL.find(text).map(|m| m.as_str().to_string()),
        "email" => RE_EMAIL.find(text).map(|m| m.as_str().to_string()),
        "path" | "filepath" | "file" => RE_FILEPATH.find(text).map(|m| m.as_str().to_string()),
        "count" | "k" | "n" | "limit" => RE_NUMBER.find(text).map(|m| m.as_str().to_string()),
        "language" | "lang" => {
            if text.chars().any(|c| c.is_ascii_alphabetic()) {
                Some("en".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn slot_schema(skill: &Value) -> Vec<(String, bool)> {
    skill
        .get("slots")
        .and_then(|s| s.as_array())
        .map(|slots| {
            slots
                .iter()
                .filter_map(|s| {
                    Some((
                        s.get("name")?.as_str()?.to_string(),
                        s.get("required").and_then(|r| r.as_bool()).unwrap_or(false),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------- route

fn synonym_map(state: &Value) -> Map<String, Value> {
    let mut nid_to_key: Map<String, Value> = Map::new();
    if let Some(nodes) = get_array(state, &["concept_graph", "nodes", "nodes"]) {
        for n in nodes {
            if let (Some(id), Some(key)) = (
                n.get("id").and_then(|i| i.as_str()),
                n.get("key").and_then(|k| k.as_str()),
            ) {
                nid_to_key.insert(id.to_string(), json!(key));
            }
        }
    }
    let mut syn: Map<String, Value> = Map::new();
    if let Some(rules) = get_array(state, &["concept_graph", "rules", "rules"]) {
        for r in rules {
            if r.get("type").and_then(|t| t.as_str()) != Some("synonym") {
                continue;
            }
            let a = r
                .get("a")
                .and_then(|v| v.as_str())
                .and_then(|id| nid_to_key.get(id))
                .and_then(|k| k.as_str());
            let b = r
                .get("b")
                .and_then(|v| v.as_str())
                .and_then(|id| nid_to_key.get(id))
                .and_then(|k| k.as_str());
            if let (Some(a), Some(b)) = (a, b) {
                for (x, y) in [(a, b), (b, a)] {
                    let entry = syn.entry(x.to_string()).or_insert_with(|| json!([]));
                    if let Some(arr) = entry.as_array_mut() {
                        arr.push(json!(y));
                    }
                }
            }
        }
    }
    syn
}

fn routing_terms(state: &Value) -> Vec<String> {
    if let Some(nodes) = get_array(state, &["concept_graph", "nodes", "nodes"]) {
        if !nodes.is_empty() {
            let mut sorted: Vec<&Value> = nodes.iter().collect();
            sorted.sort_by(|a, b| {
                b.get("score")
                    .and_then(|s| s.as_f64())
                    .unwrap_or(0.0)
                    .partial_cmp(&a.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            return sorted
                .iter()
                .take(20)
                .filter_map(|n| n.get("key").and_then(|k| k.as_str()))
                .map(str::to_string)
                .collect();
        }
    }
    packz_text(state)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn score_skill(
    skill: &Value,
    reply_top: &str,
    reply_dist: &Map<String, Value>,
    sa: Option<&str>,
    terms: &[String],
    synonyms: &Map<String, Value>,
) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut notes = Vec::new();
    let triggers = skill.get("triggers").cloned().unwrap_or_else(|| json!({}));

    if let Some(reply) = triggers.get("reply").and_then(|r| r.as_array()) {
        for r in reply.iter().filter_map(|r| r.as_str()) {
            score += 0.6 * reply_dist.get(r).and_then(|p| p.as_f64()).unwrap_or(0.0);
        }
        if reply.iter().any(|r| r.as_str() == Some(reply_top)) {
            score += 0.1;
            notes.push(format!("reply_top={reply_top}"));
        }
    }
    if let (Some(sa), Some(acts)) = (sa, triggers.get("speech_act").and_then(|s| s.as_array())) {
        if acts.iter().any(|a| a.as_str() == Some(sa)) {
            score += 0.15;
            notes.push(format!("sa={sa}"));
        }
    }
    if let Some(trigger_terms) = triggers.get("terms").and_then(|t| t.as_array()) {
        let folded: std::collections::HashSet<String> = terms.iter().map(|t| fold(t)).collect();
        let mut via_syn: std::collections::HashSet<String> = std::collections::HashSet::new();
        for t in terms {
            if let Some(list) = synonyms.get(t).and_then(|l| l.as_array()) {
                via_syn.extend(list.iter().filter_map(|s| s.as_str()).map(fold));
            }
        }
        let hits = trigger_terms
            .iter()
            .filter_map(|t| t.as_str())
            .filter(|t| folded.contains(&fold(t)) || via_syn.contains(&fold(t)))
            .count();
        if hits > 0 {
            score += (0.05 * hits as f64).min(0.2);
            notes.push(format!("term_hits={hits}"));
        }
    }
    (round6(score), notes)
}

/// Route the predicted reply onto a skill from the manifest and seed its slot
/// schema with entity/text fills.
pub fn route_intent(state: &Value) -> Result<StageOutcome> {
    let reply_top = get_str(state, &["world_model", "prediction", "top"]).unwrap_or("");
    let reply_dist = get_object(state, &["world_model", "prediction", "expected_reply"])
        .cloned()
        .unwrap_or_default();
    if reply_top.is_empty() && reply_dist.is_empty() {
        return Ok(StageOutcome::skip("no_prediction"));
    }

    let manifest: Vec<Value> = get_array(state, &["planning", "skills"])
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(default_manifest);

    let sa = get_str(state, &["world_model", "context", "features", "speech_act"]);
    let terms = routing_terms(state);
    let synonyms = synonym_map(state);
    let ents = entities(state);
    let text = packz_text(state);

    let mut best: Option<(f64, &Value, Vec<String>)> = None;
    for skill in &manifest {
        let (score, notes) = score_skill(skill, reply_top, &reply_dist, sa, &terms, &synonyms);
        if best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
            best = Some((score, skill, notes));
        }
    }
    let (score, skill, notes) = best.expect("manifest is non-empty");

    let schema = slot_schema(skill);
    let mut filled: Map<String, Value> = Map::new();
    for (name, _) in &schema {
        if let Some(v) = entity_fill(name, &ents).or_else(|| text_fill(name, &text)) {
            filled.insert(name.clone(), json!(v));
        }
    }
    let missing: Vec<&String> = schema
        .iter()
        .filter(|(name, required)| *required && !filled.contains_key(name))
        .map(|(name, _)| name)
        .collect();

    let schema_json: Vec<Value> = schema
        .iter()
        .map(|(name, required)| json!({"name": name, "required": required}))
        .collect();
    Ok(StageOutcome::ok(update(json!({"planner": {"intent": {
        "skill_id": skill.get("id"),
        "skill_name": skill.get("name"),
        "score": score,
        "rationale": notes.iter().take(8).collect::<Vec<_>>(),
        "slots": {"schema": schema_json, "filled": filled, "missing": missing},
    }}}))))
}

// ---------------------------------------------------------------- slots

fn question_for_slot(slot: &str) -> String {
    match fold(slot).as_str() {
        "url" | "link" => "Which exact link should I use?".to_string(),
        "action" => "What action should be performed?".to_string(),
        "object" => "What should the action be applied to?".to_string(),
        "email" => "Which email address?".to_string(),
        "path" => "What is the file or folder path?".to_string(),
        "language" => "Which output language do you want?".to_string(),
        "format" => "Which output format do you want?".to_string(),
        other => format!("Could you provide a value for '{other}'?"),
    }
}

/// Fill remaining slots from entities, text heuristics, and per-skill
/// defaults; propose clarifying questions for the rest and decide readiness.
pub fn collect_slots(state: &Value) -> Result<StageOutcome> {
    let Some(intent) = get_path(state, &["planner", "intent"])
        .filter(|i| i.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_intent"));
    };

    let skill_id = intent.get("skill_id").and_then(|s| s.as_str()).unwrap_or("");
    let schema: Vec<(String, bool)> = intent
        .get("slots")
        .and_then(|s| s.get("schema"))
        .and_then(|s| s.as_array())
        .map(|slots| {
            slots
                .iter()
                .filter_map(|s| {
                    Some((
                        s.get("name")?.as_str()?.to_string(),
                        s.get("required").and_then(|r| r.as_bool()).unwrap_or(false),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    let mut filled: Map<String, Value> = intent
        .get("slots")
        .and_then(|s| s.get("filled"))
        .and_then(|f| f.as_object())
        .cloned()
        .unwrap_or_default();

    let ents = entities(state);
    let text = packz_text(state);
    let defaults = get_object(state, &["planning", "skill_defaults"])
        .and_then(|d| d.get(skill_id))
        .and_then(|d| d.as_object())
        .cloned()
        .unwrap_or_default();

    let mut candidates: Map<String, Value> = Map::new();
    for (name, _) in &schema {
        if filled
            .get(name)
            .map(|v| !v.is_null() && v != &json!(""))
            .unwrap_or(false)
        {
            continue;
        }
        let mut cands: Vec<Value> = Vec::new();
        if let Some(v) = entity_fill(name, &ents) {
            cands.push(json!({"value": v, "source": "entity", "score": 0.9}));
        }
        if let Some(v) = text_fill(name, &text) {
            if cands.iter().all(|c| c["value"] != json!(v.clone())) {
                cands.push(json!({"value": v, "source": "text", "score": 0.7}));
            }
        }
        if let Some(v) = defaults.get(name) {
            if !v.is_null() {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                cands.push(json!({"value": s, "source": "default", "score": 0.55}));
            }
        }
        if let Some(top) = cands.first() {
            filled.insert(name.clone(), top["value"].clone());
        }
        candidates.insert(name.clone(), json!(cands));
    }

    let required: Vec<&String> = schema.iter().filter(|(_, r)| *r).map(|(n, _)| n).collect();
    let missing: Vec<&String> = required
        .iter()
        .filter(|n| {
            !filled
                .get(n.as_str())
                .map(|v| !v.is_null() && v != &json!(""))
                .unwrap_or(false)
        })
        .copied()
        .collect();
    let questions: Vec<Value> = missing
        .iter()
        .map(|m| json!({"slot": m, "text": question_for_slot(m)}))
        .collect();

    let mut assumptions: Vec<Value> = Vec::new();
    for (name, required) in &schema {
        if *required || !filled.contains_key(name) {
            continue;
        }
        let from_default = candidates
            .get(name)
            .and_then(|c| c.as_array())
            .map(|c| c.iter().any(|x| x["source"] == json!("default")))
            .unwrap_or(false);
        assumptions.push(json!({
            "slot": name,
            "value": filled[name],
            "confidence": if from_default { 0.6 } else { 0.75 },
            "reason": "auto-filled optional slot",
        }));
    }

    let ready = missing.is_empty();
    // Confirmation is decided by the runtime gatekeeper; this flag is the
    // fallback heuristic for states that never went through a tick.
    let u_score = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
    let u_rec = get_str(state, &["world_model", "uncertainty", "recommendation"]).unwrap_or("");
    let reply_top = get_str(state, &["world_model", "prediction", "top"]).unwrap_or("");
    let sa = get_str(state, &["world_model", "context", "features", "speech_act"]).unwrap_or("");
    let must_confirm = if ready {
        if reply_top == "execute_action" || sa == "request" || sa == "command" {
            u_score >= 0.4 || u_rec == "probe_first" || u_rec == "answer_or_probe"
        } else {
            u_score >= 0.7
        }
    } else {
        false
    };

    Ok(StageOutcome::ok(update(json!({"planner": {"slot_collect": {
        "skill_id": skill_id,
        "filled": filled,
        "missing": missing,
        "candidates": candidates,
        "questions": questions,
        "assumptions": assumptions,
        "ready": ready,
        "must_confirm": must_confirm,
    }}}))))
}

// ---------------------------------------------------------------- plan

fn confirmation_summary(skill_name: &str, filled: &Map<String, Value>) -> String {
    if filled.is_empty() {
        return format!("Confirm to run '{skill_name}'");
    }
    let mut keys: Vec<&String> = filled.keys().collect();
    keys.sort();
    let kv = keys
        .iter()
        .map(|k| {
            let v = match &filled[k.as_str()] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{k}={v}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("Confirm to run '{skill_name}' with {kv}")
}

/// Build the executable plan from the routed intent and collected slots. The
/// plan id hashes (skill, filled slots, steps). Confirmation defers to the
/// gatekeeper's gate when one exists in the state.
pub fn build_plan(state: &Value) -> Result<StageOutcome> {
    let Some(intent) = get_path(state, &["planner", "intent"])
        .filter(|i| i.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    else {
        return Ok(StageOutcome::skip("no_intent"));
    };

    let sc = get_path(state, &["planner", "slot_collect"]).cloned().unwrap_or_else(|| json!({}));
    let filled: Map<String, Value> = sc
        .get("filled")
        .and_then(|f| f.as_object())
        .cloned()
        .or_else(|| {
            intent
                .get("slots")
                .and_then(|s| s.get("filled"))
                .and_then(|f| f.as_object())
                .cloned()
        })
        .unwrap_or_default();
    let missing: Vec<String> = sc
        .get("missing")
        .and_then(|m| m.as_array())
        .or_else(|| intent.get("slots").and_then(|s| s.get("missing")).and_then(|m| m.as_array()))
        .map(|m| m.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();
    let questions = sc.get("questions").and_then(|q| q.as_array()).cloned().unwrap_or_default();

    let skill_id = intent.get("skill_id").and_then(|s| s.as_str()).unwrap_or("").to_string();
    let skill_name = intent
        .get("skill_name")
        .and_then(|s| s.as_str())
        .unwrap_or("Answer Generation")
        .to_string();
    let reply_top = get_str(state, &["world_model", "prediction", "top"]).unwrap_or("");
    let u_score = get_f64(state, &["world_model", "uncertainty", "score"]).unwrap_or(0.0);
    let u_rec = get_str(state, &["world_model", "uncertainty", "recommendation"]).unwrap_or("");

    // The gatekeeper is the single decision point when its gates are present;
    // the slot collector's flag is the pre-tick fallback.
    let must_confirm = match get_bool(state, &["runtime", "gates", "require_confirm"]) {
        Some(gate) => gate,
        None => sc.get("must_confirm").and_then(|m| m.as_bool()).unwrap_or(false),
    };

    let mut steps: Vec<Value> = Vec::new();
    let next_move;
    if !missing.is_empty() {
        let qmap: Map<String, Value> = questions
            .iter()
            .filter_map(|q| {
                Some((q.get("slot")?.as_str()?.to_string(), q.get("text")?.clone()))
            })
            .collect();
        for slot in &missing {
            let text = qmap
                .get(slot)
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Please provide '{slot}'."));
            steps.push(json!({"op": "ask_slot", "slot": slot, "text": text}));
        }
        next_move = "ask_user";
    } else {
        let summary = confirmation_summary(&skill_name, &filled);
        let answer_like = skill_id.starts_with("skill.answer")
            || skill_id.is_empty()
            || matches!(reply_top, "direct_answer" | "acknowledge_only" | "small_talk");
        if answer_like {
            if must_confirm {
                steps.push(json!({"op": "confirm", "text": summary, "expects": {"type": "yes_no"}}));
                next_move = "confirm";
            } else {
                next_move = "answer";
            }
            steps.push(json!({
                "op": "generate_answer",
                "hint": packz_text(state),
                "expects": {"type": "text"},
            }));
        } else if must_confirm {
            steps.push(json!({"op": "confirm", "text": summary, "expects": {"type": "yes_no"}}));
            steps.push(json!({
                "op": "execute_skill", "skill_id": &skill_id, "skill_name": &skill_name,
                "params": &filled, "expects": {"type": "result_or_error"},
            }));
            next_move = "confirm";
        } else {
            steps.push(json!({
                "op": "execute_skill", "skill_id": &skill_id, "skill_name": &skill_name,
                "params": &filled, "expects": {"type": "result_or_error"},
            }));
            next_move = "execute";
        }
    }

    let plan_id = content_hash(&json!({
        "skill_id": skill_id,
        "filled": &filled,
        "steps": &steps,
    }));
    let summary = if missing.is_empty() {
        confirmation_summary(&skill_name, &filled)
    } else {
        format!("Need slots: {}", missing.join(", "))
    };

    Ok(StageOutcome::ok(update(json!({"planner": {"plan": {
        "id": plan_id,
        "skill_id": skill_id,
        "skill_name": skill_name,
        "next_move": next_move,
        "steps": steps,
        "guardrails": {
            "must_confirm": must_confirm,
            "uncertainty": round3(u_score),
            "recommendation": u_rec,
        },
        "dry_run_summary": summary,
    }}}))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_types::deep_merge;

    fn request_state() -> Value {
        json!({
            "world_model": {
                "prediction": {
                    "top": "execute_action",
                    "expected_reply": {"execute_action": 0.56, "ask_clarification": 0.22, "direct_answer": 0.18},
                },
                "context": {"features": {"speech_act": "request"}},
                "uncertainty": {"score": 0.2, "recommendation": "act_first"},
            },
            "perception": {
                "packz": {"text": "please summarize https://example.com/report.pdf"},
                "entities": [{"type": "action", "value": "summarize"}],
            },
            "planning": {"skills": [
                {"id": "skill.web_summarize", "name": "Web Document Summarizer",
                 "triggers": {"reply": ["execute_action"], "speech_act": ["request", "command"],
                              "terms": ["summary", "summarize"]},
                 "slots": [{"name": "action", "required": true}, {"name": "url", "required": true}]},
                {"id": "skill.answer", "name": "Answer Generation",
                 "triggers": {"reply": ["direct_answer", "ask_clarification"], "speech_act": ["question"]},
                 "slots": []},
            ]},
        })
    }

    fn run_planning(mut state: Value) -> Value {
        for stage in [route_intent, collect_slots, build_plan] {
            let out = stage(&state).unwrap();
            deep_merge(&mut state, Value::Object(out.update));
        }
        state
    }

    #[test]
    fn routes_to_matching_skill_and_fills_slots() {
        let state = run_planning(request_state());
        let intent = &state["planner"]["intent"];
        assert_eq!(intent["skill_id"], json!("skill.web_summarize"));
        let filled = &state["planner"]["slot_collect"]["filled"];
        assert_eq!(filled["action"], json!("summarize"));
        assert_eq!(filled["url"], json!("https://example.com/report.pdf"));
    }

    #[test]
    fn ready_low_uncertainty_plan_executes() {
        let state = run_planning(request_state());
        let plan = &state["planner"]["plan"];
        assert_eq!(plan["next_move"], json!("execute"));
        assert_eq!(plan["steps"][0]["op"], json!("execute_skill"));
        assert_eq!(plan["guardrails"]["must_confirm"], json!(false));
    }

    #[test]
    fn gatekeeper_gate_overrides_slot_heuristic() {
        let mut seeded = request_state();
        seeded["runtime"] = json!({"gates": {"require_confirm": true}});
        let state = run_planning(seeded);
        let plan = &state["planner"]["plan"];
        assert_eq!(plan["next_move"], json!("confirm"));
        assert_eq!(plan["steps"][0]["op"], json!("confirm"));
    }

    #[test]
    fn missing_slots_yield_questions() {
        let mut seeded = request_state();
        seeded["perception"]["packz"]["text"] = json!("please summarize it");
        seeded["perception"]["entities"] = json!([]);
        let state = run_planning(seeded);
        let plan = &state["planner"]["plan"];
        assert_eq!(plan["next_move"], json!("ask_user"));
        assert_eq!(plan["steps"][0]["op"], json!("ask_slot"));
    }

    #[test]
    fn plan_id_is_deterministic_in_inputs() {
        let a = run_planning(request_state());
        let b = run_planning(request_state());
        assert_eq!(a["planner"]["plan"]["id"], b["planner"]["plan"]["id"]);
    }
}
