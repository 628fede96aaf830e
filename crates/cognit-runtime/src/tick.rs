use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};

use cognit_drivers::Drivers;
use cognit_kernel::{KernelReport, REPLY_ORDER, TICK_ORDER, TURN_ORDER, kernel_step};
use cognit_types::{get_array, get_i64, get_path};

use crate::registry::build_registry;

const RECENT_PACKZ_KEEP: usize = 6;
const RECENT_TEXTS_KEEP: usize = 8;

/// What one tick did: the composer reports of both passes and how many
/// frames were dispatched.
#[derive(Debug, Serialize)]
pub struct TickReport {
    pub first_pass: KernelReport,
    pub second_pass: Option<KernelReport>,
    pub dispatched: usize,
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stamp the tick clock; within a session the clock never moves backwards.
fn stamp_clock(state: &mut Value, now_ms: i64) {
    let previous = get_i64(state, &["clock", "now_ms"]).unwrap_or(0);
    cognit_types::set_dotted(state, "clock.now_ms", json!(now_ms.max(previous)));
}

fn dispatch_frames(frames: &[Value], drivers: &Drivers) -> Vec<Value> {
    let mut replies = Vec::new();
    for frame in frames {
        let reply = match frame.get("type").and_then(|t| t.as_str()) {
            Some("transport") => drivers.transport.emit(frame),
            Some("skills") => drivers.skills.execute(frame),
            Some("storage") => drivers.storage.apply_index(frame),
            Some("timer") => drivers.timer.sleep(frame),
            other => {
                tracing::warn!(frame_type = ?other, "skipping frame with unknown type");
                continue;
            }
        };
        match reply {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                // A driver error is a failed delivery, not a tick failure;
                // the retry planner sees it as a not-ok reply.
                tracing::warn!(error = %e, "driver call failed");
                replies.push(json!({
                    "type": frame.get("type"),
                    "ok": false,
                    "error": {"message": e.to_string()},
                }));
            }
        }
    }
    replies
}

/// One I/O tick at an explicit clock value: compose the default order,
/// dispatch the produced protocol frames, reinject the replies, and run the
/// reply pass. Pure except for the driver calls.
pub fn run_tick_at(state: &Value, drivers: &Drivers, now_ms: i64) -> (Value, TickReport) {
    let registry = build_registry();
    let mut state = state.clone();
    stamp_clock(&mut state, now_ms);

    let (mut state, first_pass) = kernel_step(&state, &registry, TICK_ORDER);

    let frames: Vec<Value> = get_array(&state, &["driver", "protocol", "frames"])
        .cloned()
        .unwrap_or_default();
    if frames.is_empty() {
        return (
            state,
            TickReport {
                first_pass,
                second_pass: None,
                dispatched: 0,
            },
        );
    }

    let replies = dispatch_frames(&frames, drivers);
    let dispatched = replies.len();
    cognit_types::set_dotted(&mut state, "driver.replies", json!(replies));

    let (state, second_pass) = kernel_step(&state, &registry, REPLY_ORDER);
    (
        state,
        TickReport {
            first_pass,
            second_pass: Some(second_pass),
            dispatched,
        },
    )
}

/// One I/O tick stamped with the wall clock.
pub fn run_tick(state: &Value, drivers: &Drivers) -> (Value, TickReport) {
    run_tick_at(state, drivers, wall_clock_ms())
}

/// Rotate the finished turn's artifacts out of the state before the next
/// message: the current PackZ joins the recent-context ring and turn-scoped
/// subtrees are dropped. Long-lived trees (session, clock, world-model
/// traces, concept graph, policy, runtime config, initiative, storage seq)
/// survive untouched.
fn rotate_turn_state(state: &mut Value) {
    if let Some(packz) = get_path(state, &["perception", "packz"])
        .filter(|p| p.get("id").and_then(|i| i.as_str()).map(|i| !i.is_empty()).unwrap_or(false))
        .cloned()
    {
        let mut recent: Vec<Value> = get_array(state, &["context", "recent_packz"])
            .cloned()
            .unwrap_or_default();
        recent.push(json!({"packz": packz}));
        if recent.len() > RECENT_PACKZ_KEEP {
            recent = recent.split_off(recent.len() - RECENT_PACKZ_KEEP);
        }
        cognit_types::set_dotted(state, "context.recent_packz", json!(recent));
    }
    if let Some(text) = get_path(state, &["perception", "packz", "text"])
        .and_then(|t| t.as_str())
        .map(str::to_string)
    {
        let mut texts: Vec<Value> = get_array(state, &["context", "recent_texts"])
            .cloned()
            .unwrap_or_default();
        texts.push(json!(text));
        if texts.len() > RECENT_TEXTS_KEEP {
            texts = texts.split_off(texts.len() - RECENT_TEXTS_KEEP);
        }
        cognit_types::set_dotted(state, "context.recent_texts", json!(texts));
    }

    if let Some(map) = state.as_object_mut() {
        for key in ["events", "perception", "planner", "dialog", "engine"] {
            map.remove(key);
        }
        // Pending retries and the attempts ledger survive the turn boundary;
        // the rest of the driver scratch space does not.
        if let Some(driver) = map.remove("driver") {
            let mut kept = serde_json::Map::new();
            if let Some(retry) = driver.get("retry").filter(|r| {
                r.get("jobs").and_then(|j| j.as_array()).map(|j| !j.is_empty()).unwrap_or(false)
            }) {
                kept.insert("retry".to_string(), retry.clone());
            }
            if let Some(history) = driver.get("history") {
                kept.insert("history".to_string(), history.clone());
            }
            if !kept.is_empty() {
                map.insert("driver".to_string(), Value::Object(kept));
            }
        }
        if let Some(executor) = map.get_mut("executor").and_then(|e| e.as_object_mut()) {
            executor.remove("requests");
            executor.remove("responses");
        }
        if let Some(memory) = map.get_mut("memory").and_then(|m| m.as_object_mut()) {
            memory.remove("wal");
            memory.remove("retrieval");
            memory.remove("index_ops");
        }
        if let Some(storage) = map.get_mut("storage").and_then(|s| s.as_object_mut()) {
            storage.remove("apply");
            storage.remove("apply_optimized");
        }
        map.remove("index");
    }
}

/// Process one user message at an explicit clock value: rotate the previous
/// turn into context, seed the raw events, run the turn composition, then a
/// full I/O tick.
pub fn run_turn_at(
    state: &Value,
    events: Vec<Value>,
    drivers: &Drivers,
    now_ms: i64,
) -> Result<(Value, TickReport)> {
    let registry = build_registry();
    let mut state = state.clone();
    rotate_turn_state(&mut state);
    stamp_clock(&mut state, now_ms);
    if let Some(map) = state.as_object_mut() {
        map.insert("events".to_string(), json!(events));
    }

    let (state, turn_report) = kernel_step(&state, &registry, TURN_ORDER);
    tracing::debug!(
        ran = turn_report.ran.len(),
        skipped = turn_report.skipped.len(),
        errors = turn_report.errors.len(),
        "turn pass complete"
    );

    let (state, report) = run_tick_at(&state, drivers, now_ms);
    Ok((state, report))
}

/// Process one user message stamped with the wall clock.
pub fn run_turn(state: &Value, events: Vec<Value>, drivers: &Drivers) -> Result<(Value, TickReport)> {
    run_turn_at(state, events, drivers, wall_clock_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drivers() -> Drivers {
        Drivers::local(":memory:").unwrap()
    }

    #[test]
    fn clock_is_monotonic_within_a_session() {
        let state = json!({"session": {"thread_id": "t-1"}, "clock": {"now_ms": 5000}});
        let (next, _) = run_tick_at(&state, &drivers(), 1000);
        assert_eq!(next["clock"]["now_ms"], json!(5000));
        let (next, _) = run_tick_at(&next, &drivers(), 9000);
        assert_eq!(next["clock"]["now_ms"], json!(9000));
    }

    #[test]
    fn bare_tick_without_work_dispatches_nothing() {
        let state = json!({"session": {"thread_id": "t-1"}});
        let (_, report) = run_tick_at(&state, &drivers(), 1000);
        assert_eq!(report.dispatched, 0);
        assert!(report.second_pass.is_none());
    }

    #[test]
    fn rotate_moves_packz_into_recent_context() {
        let mut state = json!({
            "session": {"thread_id": "t-1"},
            "perception": {"packz": {"id": "p1", "text": "first message"}},
            "dialog": {"final": {"move": "answer", "text": "done"}},
        });
        rotate_turn_state(&mut state);
        assert!(state.get("perception").is_none());
        assert!(state.get("dialog").is_none());
        let recent = state["context"]["recent_packz"].as_array().unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0]["packz"]["id"], json!("p1"));
        assert_eq!(state["context"]["recent_texts"], json!(["first message"]));
    }
}
