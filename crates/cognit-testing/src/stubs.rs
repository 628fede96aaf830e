use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{Value, json};

use cognit_drivers::{
    Drivers, SkillsDriver, StorageDriver, TimerDriver, TransportDriver,
};

/// Records every frame it sees and answers with a canned deterministic
/// reply. Replay-idempotency tests rely on the replies being pure functions
/// of the frame.
pub struct RecordingDriver {
    kind: &'static str,
    pub frames: Mutex<Vec<Value>>,
    fail: bool,
}

impl RecordingDriver {
    fn new(kind: &'static str, fail: bool) -> Self {
        RecordingDriver {
            kind,
            frames: Mutex::new(Vec::new()),
            fail,
        }
    }

    fn record(&self, frame: &Value) {
        self.frames.lock().expect("frames lock").push(frame.clone());
    }

    fn reply(&self, frame: &Value) -> Value {
        let ok = !self.fail;
        match self.kind {
            "transport" => json!({
                "type": "transport",
                "ok": ok,
                "channel": frame.get("channel").cloned().unwrap_or(json!("default")),
                "messages": frame.get("messages").cloned().unwrap_or(json!([])),
            }),
            "skills" => {
                let calls: Vec<Value> = frame
                    .get("calls")
                    .and_then(|c| c.as_array())
                    .map(|calls| {
                        calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "ok": ok,
                                    "req_id": c.get("req_id"),
                                    "kind": "json",
                                    "text": "",
                                    "data": {"echo": c.get("params").cloned().unwrap_or(json!({}))},
                                    "usage": {"cost": 0.0, "input_tokens": 0, "output_tokens": 0},
                                    "latency_ms": 5,
                                    "score": 0.5,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                json!({"type": "skills", "ok": ok, "calls": calls})
            }
            "storage" => json!({
                "type": "storage",
                "ok": ok,
                "apply": {"ops": frame.get("apply").cloned().unwrap_or(json!([]))},
                "index": {"queue": frame.get("index").cloned().unwrap_or(json!([]))},
            }),
            _ => json!({
                "type": "timer",
                "ok": ok,
                "sleep_ms": frame.get("sleep_ms").cloned().unwrap_or(json!(0)),
            }),
        }
    }
}

impl TransportDriver for RecordingDriver {
    fn emit(&self, frame: &Value) -> Result<Value> {
        self.record(frame);
        Ok(self.reply(frame))
    }
}

impl SkillsDriver for RecordingDriver {
    fn execute(&self, frame: &Value) -> Result<Value> {
        self.record(frame);
        Ok(self.reply(frame))
    }
}

impl StorageDriver for RecordingDriver {
    fn apply_index(&self, frame: &Value) -> Result<Value> {
        self.record(frame);
        Ok(self.reply(frame))
    }
}

impl TimerDriver for RecordingDriver {
    fn sleep(&self, frame: &Value) -> Result<Value> {
        self.record(frame);
        Ok(self.reply(frame))
    }
}

/// The four recording stubs plus the assembled driver set handed to the
/// tick. Keep the struct alive to inspect captured frames after the run.
pub struct StubDrivers {
    pub transport: Arc<RecordingDriver>,
    pub skills: Arc<RecordingDriver>,
    pub storage: Arc<RecordingDriver>,
    pub timer: Arc<RecordingDriver>,
}

impl StubDrivers {
    pub fn ok() -> Self {
        StubDrivers {
            transport: Arc::new(RecordingDriver::new("transport", false)),
            skills: Arc::new(RecordingDriver::new("skills", false)),
            storage: Arc::new(RecordingDriver::new("storage", false)),
            timer: Arc::new(RecordingDriver::new("timer", false)),
        }
    }

    /// Every subsystem reports per-unit failure; retry-planner tests use
    /// this to exercise the budget path.
    pub fn failing() -> Self {
        StubDrivers {
            transport: Arc::new(RecordingDriver::new("transport", true)),
            skills: Arc::new(RecordingDriver::new("skills", true)),
            storage: Arc::new(RecordingDriver::new("storage", true)),
            timer: Arc::new(RecordingDriver::new("timer", false)),
        }
    }

    pub fn drivers(&self) -> Drivers {
        Drivers {
            transport: self.transport.clone(),
            skills: self.skills.clone(),
            storage: self.storage.clone(),
            timer: self.timer.clone(),
        }
    }

    pub fn transport_frames(&self) -> Vec<Value> {
        self.transport.frames.lock().expect("frames lock").clone()
    }

    pub fn skills_frames(&self) -> Vec<Value> {
        self.skills.frames.lock().expect("frames lock").clone()
    }

    pub fn storage_frames(&self) -> Vec<Value> {
        self.storage.frames.lock().expect("frames lock").clone()
    }
}
