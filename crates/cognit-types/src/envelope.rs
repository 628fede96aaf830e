use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Classification of a stage result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Skip,
    Fail,
}

/// The envelope every stage returns: a status, namespaced state updates, and
/// an optional diagnostic payload. Keys in `update` are top-level subtrees of
/// the shared state and are deep-merged by the composer on `Ok`.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: Status,
    pub update: Map<String, Value>,
    pub diag: Option<Value>,
}

impl StageOutcome {
    pub fn ok(update: Map<String, Value>) -> Self {
        StageOutcome {
            status: Status::Ok,
            update,
            diag: Some(json!({"reason": "ok"})),
        }
    }

    pub fn ok_with(update: Map<String, Value>, diag: Value) -> Self {
        StageOutcome {
            status: Status::Ok,
            update,
            diag: Some(diag),
        }
    }

    pub fn skip(reason: &str) -> Self {
        StageOutcome {
            status: Status::Skip,
            update: Map::new(),
            diag: Some(json!({"reason": reason})),
        }
    }

    pub fn skip_with(reason: &str, update: Map<String, Value>) -> Self {
        StageOutcome {
            status: Status::Skip,
            update,
            diag: Some(json!({"reason": reason})),
        }
    }

    pub fn fail(reason: &str) -> Self {
        StageOutcome {
            status: Status::Fail,
            update: Map::new(),
            diag: Some(json!({"reason": reason})),
        }
    }

    /// Diagnostic reason, if one was recorded.
    pub fn reason(&self) -> Option<&str> {
        self.diag.as_ref()?.get("reason")?.as_str()
    }
}

/// A pure transformation stage. The composer hands it the current state and
/// deep-merges the outcome's `update` back on `Ok`. Stages must not read
/// time, randomness, or I/O beyond what the state already carries.
pub type StageFn = fn(&Value) -> anyhow::Result<StageOutcome>;

/// Convert a `json!({...})` literal into an update map. Non-object values
/// yield an empty update.
pub fn update(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}
