use cognit_api::{AppState, chat_blocking};
use serde_json::json;

#[test]
fn chat_runs_a_turn_and_reports_the_final_move() {
    let app = AppState::in_memory().unwrap();
    let reply = chat_blocking(&app, "t-e2e", "what is the current plan?").unwrap();
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["thread_id"], json!("t-e2e"));
    let final_move = reply["final"]["move"].as_str().unwrap();
    assert!(["answer", "confirm", "ask"].contains(&final_move));
    // The reply lands in the thread's transport channel.
    let emitted = reply["emitted"].as_array().unwrap();
    assert!(!emitted.is_empty(), "expected at least one outbox message");
}

#[test]
fn definitions_are_captured_and_answered_from_the_fact_store() {
    let app = AppState::in_memory().unwrap();

    let noted = chat_blocking(&app, "t-facts", "flux capacitor is the time travel part").unwrap();
    let noted_text = noted["emitted"][0]["text"].as_str().unwrap();
    assert!(noted_text.starts_with("Noted:"));

    let answer = chat_blocking(&app, "t-facts", "what is flux capacitor?").unwrap();
    let answer_text = answer["emitted"][0]["text"].as_str().unwrap();
    assert!(answer_text.contains("the time travel part"));

    // Facts are per-thread.
    let other = chat_blocking(&app, "t-other", "what is flux capacitor?").unwrap();
    let other_first = other["emitted"]
        .as_array()
        .unwrap()
        .first()
        .and_then(|m| m["text"].as_str())
        .unwrap_or("");
    assert!(!other_first.contains("time travel part"));
}

#[test]
fn sessions_keep_independent_outbox_channels() {
    let app = AppState::in_memory().unwrap();
    chat_blocking(&app, "t-a", "hello there").unwrap();
    chat_blocking(&app, "t-b", "different thread").unwrap();
    let a_msgs = app.transport.channel_messages("t-a");
    let b_msgs = app.transport.channel_messages("t-b");
    assert!(!a_msgs.is_empty());
    assert!(!b_msgs.is_empty());
    assert_ne!(a_msgs[0]["text"], b_msgs[0]["text"]);
}

#[test]
fn ticks_are_serialized_per_session_and_state_persists() {
    let app = AppState::in_memory().unwrap();
    chat_blocking(&app, "t-persist", "remember the apples").unwrap();
    let state = app.ensure_session("t-persist").unwrap();
    // The turn rotated into recent context and the runtime config activated.
    assert!(state["context"]["recent_packz"].as_array().is_some());
    assert!(state["runtime"]["config"].is_object());
    assert_eq!(state["session"]["thread_id"], json!("t-persist"));
}
