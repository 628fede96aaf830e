use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};

use crate::TimerDriver;

/// Blocking sleep bounded by the frame's deadline. Sleeping is the whole
/// effect, so duplicates need no coalescing.
#[derive(Default)]
pub struct BlockingTimer;

impl TimerDriver for BlockingTimer {
    fn sleep(&self, frame: &Value) -> Result<Value> {
        let ms = frame.get("sleep_ms").and_then(|m| m.as_i64()).unwrap_or(0).max(0);
        let deadline = frame
            .get("deadline_ms")
            .and_then(|d| d.as_i64())
            .unwrap_or(ms + 2000)
            .max(0);
        let bounded = ms.min(deadline) as u64;
        if bounded > 0 {
            std::thread::sleep(Duration::from_millis(bounded));
        }
        Ok(json!({"type": "timer", "ok": true, "sleep_ms": ms}))
    }
}
