use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;

use crate::routes::chat_blocking;
use crate::state::AppState;

const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Push channel: forwards transport outbox entries for the thread as they
/// appear. Delivery order matches emission order within the channel.
pub async fn ws_push(
    ws: WebSocketUpgrade,
    Path(thread_id): Path<String>,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_loop(socket, thread_id, app))
}

async fn push_loop(mut socket: WebSocket, thread_id: String, app: Arc<AppState>) {
    let mut offset = 0usize;
    loop {
        let (entries, next_offset) = app.transport.since(offset);
        offset = next_offset;
        for entry in entries {
            if entry.channel != thread_id {
                continue;
            }
            let Some(text) = entry.message.get("text").and_then(|t| t.as_str()) else {
                continue;
            };
            if socket.send(Message::Text(text.to_string().into())).await.is_err() {
                return;
            }
        }
        tokio::time::sleep(PUSH_POLL_INTERVAL).await;
    }
}

/// Chat channel: each incoming text runs a full turn; replies flow through
/// the push channel. Slash commands answer from the fact store and the
/// full-text index.
pub async fn ws_chat(
    ws: WebSocketUpgrade,
    Path(thread_id): Path<String>,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| chat_loop(socket, thread_id, app))
}

async fn chat_loop(mut socket: WebSocket, thread_id: String, app: Arc<AppState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else { continue };
        let text = text.to_string();
        let app = app.clone();
        let thread_id = thread_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            handle_chat_message(&app, &thread_id, text.trim())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "chat message failed"),
            Err(e) => tracing::warn!(error = %e, "chat task panicked"),
        }
    }
}

fn handle_chat_message(app: &AppState, thread_id: &str, text: &str) -> anyhow::Result<()> {
    if let Some(command_output) = run_command(app, thread_id, text)? {
        app.say(thread_id, &command_output)?;
        return Ok(());
    }
    chat_blocking(app, thread_id, text)?;
    Ok(())
}

/// Debug commands: `/facts`, `/forget <key>`, `/search <query>`. Anything
/// else flows into the cognitive loop.
fn run_command(app: &AppState, thread_id: &str, text: &str) -> anyhow::Result<Option<String>> {
    if text == "/facts" {
        let facts = app.storage.fact_list(thread_id, 200)?;
        let listed: Vec<_> = facts
            .iter()
            .map(|(k, v)| json!({"k": k, "v": v}))
            .collect();
        return Ok(Some(format!("FACTS {}", json!(listed))));
    }
    if let Some(key) = text.strip_prefix("/forget ") {
        let removed = app.storage.fact_delete(thread_id, key.trim())?;
        return Ok(Some(format!("FORGET removed={removed}")));
    }
    if let Some(query) = text.strip_prefix("/search ") {
        let hits = app.storage.search(query.trim(), 10)?;
        let preview: Vec<_> = hits
            .iter()
            .take(3)
            .filter_map(|h| h.get("snippet").and_then(|s| s.as_str()))
            .collect();
        return Ok(Some(format!(
            "SEARCH {}",
            json!({"q": query.trim(), "top": preview})
        )));
    }
    Ok(None)
}
