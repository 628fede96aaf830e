use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use cognit_types::{get_f64, get_i64, get_path, get_str};

use crate::facts::{extract_definitions, extract_question_key};
use crate::state::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------- health

pub async fn health(State(app): State<Arc<AppState>>) -> ApiResult {
    let sessions = app.sessions.all().map_err(internal)?;
    let mut summary: Vec<Value> = sessions
        .iter()
        .map(|(tid, state)| {
            json!({
                "thread_id": tid,
                "uncertainty": get_f64(state, &["world_model", "uncertainty", "score"]),
                "policy_updates": get_i64(state, &["adaptation", "policy", "updates"]),
                "avg_reward": get_f64(state, &["adaptation", "policy", "avg_reward"]),
                "concept_version": get_str(state, &["concept_graph", "version", "id"]),
            })
        })
        .collect();
    summary.sort_by(|a, b| {
        a["thread_id"]
            .as_str()
            .unwrap_or("")
            .cmp(b["thread_id"].as_str().unwrap_or(""))
    });
    Ok(Json(json!({"ok": true, "name": "cognit-server", "sessions": summary})))
}

// ---------------------------------------------------------------- state

pub async fn state_snapshot(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult {
    let state = app.ensure_session(&thread_id).map_err(internal)?;
    let keys: Vec<&String> = state.as_object().map(|o| o.keys().collect()).unwrap_or_default();
    Ok(Json(json!({
        "thread_id": thread_id,
        "snapshot": {
            "keys": keys,
            "has_executor_results": get_path(&state, &["executor", "results"]).is_some(),
            "has_transport_outbound": get_path(&state, &["transport", "outbound"]).is_some(),
        },
    })))
}

// ---------------------------------------------------------------- chat

#[derive(Deserialize)]
pub struct ChatRequest {
    pub thread_id: String,
    pub text: String,
}

/// Run one message through the session: fact shortcuts first (definition
/// capture, answer overrides), otherwise the full cognitive turn. The reply
/// reports the final dialog move and the outbox entries this call emitted.
pub fn chat_blocking(app: &AppState, thread_id: &str, text: &str) -> anyhow::Result<Value> {
    let outbox_before = app.transport.len();

    // Answer overrides come before definition capture: a "what is x"
    // question would otherwise parse as the definition "what = x".
    let mut handled = false;
    let question = extract_question_key(text);
    if let Some(key) = &question {
        if let Some((k_raw, v_raw)) = app.storage.fact_get(thread_id, key)? {
            app.say(thread_id, &format!("{k_raw} = {v_raw}"))?;
            handled = true;
        }
    }
    if !handled && question.is_none() {
        let definitions = extract_definitions(text);
        if !definitions.is_empty() {
            for (k, v) in &definitions {
                app.storage.fact_upsert(thread_id, k, v)?;
            }
            let noted = definitions
                .iter()
                .map(|(k, v)| format!("{k} = {v}"))
                .collect::<Vec<_>>()
                .join("; ");
            app.say(thread_id, &format!("Noted: {noted}"))?;
            handled = true;
        }
    }

    let (state, report) = if handled {
        app.tick_session(thread_id)?
    } else {
        let events = vec![
            json!({"type": "typing_start"}),
            json!({"type": "message_commit", "text": text, "t": now_iso()}),
        ];
        app.turn_session(thread_id, events)?
    };

    let (emitted, _) = app.transport.since(outbox_before);
    let emitted: Vec<Value> = emitted
        .into_iter()
        .filter(|e| e.channel == thread_id)
        .map(|e| e.message)
        .collect();

    Ok(json!({
        "ok": true,
        "thread_id": thread_id,
        "final": get_path(&state, &["dialog", "final"]).cloned(),
        "emitted": emitted,
        "report": {
            "ran": report.first_pass.ran,
            "skipped": report.first_pass.skipped,
            "errors": report.first_pass.errors,
            "dispatched": report.dispatched,
        },
    }))
}

pub async fn chat(State(app): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || {
        chat_blocking(&app, &req.thread_id, &req.text)
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------- tick

#[derive(Deserialize)]
pub struct TickRequest {
    pub thread_id: String,
}

pub async fn tick(State(app): State<Arc<AppState>>, Json(req): Json<TickRequest>) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        let (state, report) = app.tick_session(&req.thread_id)?;
        let keys: Vec<&String> = state.as_object().map(|o| o.keys().collect()).unwrap_or_default();
        Ok(json!({
            "ok": true,
            "thread_id": req.thread_id,
            "snapshot": {
                "keys": keys,
                "has_executor_results": get_path(&state, &["executor", "results"]).is_some(),
                "has_transport_outbound": get_path(&state, &["transport", "outbound"]).is_some(),
            },
            "report": {
                "ran": report.first_pass.ran,
                "errors": report.first_pass.errors,
                "dispatched": report.dispatched,
            },
        }))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------- skills

#[derive(Deserialize)]
pub struct SkillCall {
    pub req_id: String,
    pub skill_id: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Deserialize)]
pub struct SkillsRequest {
    pub thread_id: String,
    pub calls: Vec<SkillCall>,
}

pub async fn skills(State(app): State<Arc<AppState>>, Json(req): Json<SkillsRequest>) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        let calls: Vec<Value> = req
            .calls
            .iter()
            .map(|c| {
                json!({
                    "req_id": c.req_id,
                    "skill_id": c.skill_id,
                    "params": if c.params.is_null() { json!({}) } else { c.params.clone() },
                    "timeout_ms": 30_000,
                    "idempotency_key": c.req_id,
                })
            })
            .collect();
        let (state, _) = app.with_session_tick(&req.thread_id, |state| {
            let mut requests: Vec<Value> = cognit_types::get_array(state, &["executor", "requests"])
                .cloned()
                .unwrap_or_default();
            requests.extend(calls);
            cognit_types::set_dotted(state, "executor.requests", json!(requests));
        })?;
        Ok(json!({
            "ok": true,
            "thread_id": req.thread_id,
            "aggregate": get_path(&state, &["executor", "results", "aggregate"]).cloned(),
        }))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------- policy

#[derive(Deserialize)]
pub struct PolicyChange {
    pub path: String,
    pub new_value: Value,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Deserialize)]
pub struct PolicyApplyRequest {
    pub thread_id: String,
    pub changes: Vec<PolicyChange>,
}

pub async fn policy_apply(
    State(app): State<Arc<AppState>>,
    Json(req): Json<PolicyApplyRequest>,
) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        let changes: Vec<Value> = req
            .changes
            .iter()
            .map(|c| {
                json!({
                    "path": c.path,
                    "new_value": c.new_value,
                    "change_type": c.change_type.as_deref().unwrap_or("set"),
                    "rationale": c.rationale.as_deref().unwrap_or("operator change"),
                    "confidence": c.confidence.unwrap_or(0.9),
                })
            })
            .collect();
        let (state, _) = app.with_session_tick(&req.thread_id, |state| {
            cognit_types::set_dotted(
                state,
                "policy.delta",
                json!({
                    "changes": changes,
                    "guards": {"max_changes": changes.len(), "ttl": {"seconds": 3600},
                               "applies_safely": true},
                    "meta": {"created_at": now_iso()},
                }),
            );
        })?;
        Ok(json!({
            "ok": true,
            "thread_id": req.thread_id,
            "version": get_path(&state, &["runtime", "version"]).cloned(),
            "diff": get_path(&state, &["runtime", "diff"]).cloned(),
        }))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------- knowledge

#[derive(Deserialize)]
pub struct IngestRequest {
    pub thread_id: String,
    pub doc_id: String,
    pub text: String,
}

pub async fn knowledge_ingest(
    State(app): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        app.storage.index_doc(&req.doc_id, &req.text)?;
        Ok(json!({"ok": true, "thread_id": req.thread_id, "doc_id": req.doc_id}))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}

// ---------------------------------------------------------------- initiative

#[derive(Deserialize)]
pub struct InitiativeItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub when_ms: Option<i64>,
    #[serde(default)]
    pub in_ms: Option<i64>,
    #[serde(default = "default_once")]
    pub once: bool,
    #[serde(default)]
    pub cooldown_ms: i64,
    #[serde(default)]
    pub payload: Value,
}

fn default_once() -> bool {
    true
}

#[derive(Deserialize)]
pub struct InitiativeAddRequest {
    pub thread_id: String,
    pub items: Vec<InitiativeItem>,
}

pub async fn initiative_add(
    State(app): State<Arc<AppState>>,
    Json(req): Json<InitiativeAddRequest>,
) -> ApiResult {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        let wall_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let items: Vec<Value> = req
            .items
            .iter()
            .map(|item| {
                let when = item
                    .when_ms
                    .unwrap_or_else(|| wall_ms + item.in_ms.unwrap_or(0).max(0));
                json!({
                    "id": item.id,
                    "type": item.kind,
                    "when_ms": when,
                    "once": item.once,
                    "cooldown_ms": item.cooldown_ms,
                    "payload": if item.payload.is_null() { json!({}) } else { item.payload.clone() },
                })
            })
            .collect();
        let queued = items.len();
        let (state, _) = app.with_session_tick(&req.thread_id, |state| {
            let mut queue: Vec<Value> = cognit_types::get_array(state, &["initiative", "queue"])
                .cloned()
                .unwrap_or_default();
            queue.extend(items);
            cognit_types::set_dotted(state, "initiative.queue", json!(queue));
        })?;
        Ok(json!({
            "ok": true,
            "thread_id": req.thread_id,
            "queued": queued,
            "remaining": cognit_types::get_array(&state, &["initiative", "queue"])
                .map(|q| q.len())
                .unwrap_or(0),
        }))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(result))
}
