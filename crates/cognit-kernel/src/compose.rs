use std::collections::BTreeMap;

use cognit_types::{StageFn, StageOutcome, Status, deep_merge};
use serde::Serialize;
use serde_json::{Value, json};

pub const RULES_VERSION: &str = "1.0";

/// Name → stage map. A BTreeMap keeps registry listings deterministic.
pub type Registry = BTreeMap<&'static str, StageFn>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepError {
    pub step: String,
    pub error: String,
}

/// Per-pass report of what the composer did.
#[derive(Debug, Clone, Serialize)]
pub struct KernelReport {
    pub status: Status,
    pub ran: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<StepError>,
    pub rules_version: String,
}

impl KernelReport {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Compose an ordered sequence of pure stages against a shared state.
///
/// For each name in `order`: a missing registry entry is recorded as skipped;
/// a stage error is recorded and the walk continues (the composer never
/// aborts); `Skip` outcomes are recorded; `Ok` outcomes have every update key
/// deep-merged into the state. The final status is `Ok` iff no stage errored.
///
/// Stages receive an immutable borrow of the current state, which gives the
/// same isolation the contract's defensive copy asks for: a stage cannot
/// affect its successors except through the merged outcome.
pub fn kernel_step(state: &Value, registry: &Registry, order: &[&str]) -> (Value, KernelReport) {
    let mut merged = state.clone();
    if !merged.is_object() {
        merged = json!({});
    }

    let mut ran = Vec::new();
    let mut skipped = Vec::new();
    let mut errors = Vec::new();

    for name in order {
        let Some(stage) = registry.get(name) else {
            skipped.push((*name).to_string());
            continue;
        };
        match stage(&merged) {
            Err(e) => errors.push(StepError {
                step: (*name).to_string(),
                error: format!("{e:#}"),
            }),
            Ok(StageOutcome {
                status: Status::Skip,
                ..
            }) => skipped.push((*name).to_string()),
            Ok(StageOutcome {
                status: Status::Fail,
                diag,
                ..
            }) => {
                let reason = diag
                    .as_ref()
                    .and_then(|d| d.get("reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown");
                errors.push(StepError {
                    step: (*name).to_string(),
                    error: reason.to_string(),
                });
            }
            Ok(StageOutcome {
                status: Status::Ok,
                update,
                ..
            }) => {
                for (k, v) in update {
                    match merged.get_mut(&k) {
                        Some(slot) => deep_merge(slot, v),
                        None => {
                            if let Some(map) = merged.as_object_mut() {
                                map.insert(k, v);
                            }
                        }
                    }
                }
                ran.push((*name).to_string());
            }
        }
    }

    let report = KernelReport {
        status: if errors.is_empty() {
            Status::Ok
        } else {
            Status::Fail
        },
        ran,
        skipped,
        errors,
        rules_version: RULES_VERSION.to_string(),
    };
    (merged, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use cognit_types::update;

    fn stage_a(_s: &Value) -> anyhow::Result<StageOutcome> {
        Ok(StageOutcome::ok(update(json!({"a": {"hit": true}}))))
    }

    fn stage_b(s: &Value) -> anyhow::Result<StageOutcome> {
        // Reads what stage_a wrote through the merged state.
        let seen = s.get("a").and_then(|a| a.get("hit")).is_some();
        Ok(StageOutcome::ok(update(json!({"b": {"saw_a": seen}}))))
    }

    fn stage_skip(_s: &Value) -> anyhow::Result<StageOutcome> {
        Ok(StageOutcome::skip("missing_input"))
    }

    fn stage_boom(_s: &Value) -> anyhow::Result<StageOutcome> {
        bail!("boom")
    }

    fn registry() -> Registry {
        let mut r: Registry = BTreeMap::new();
        r.insert("a", stage_a as StageFn);
        r.insert("b", stage_b as StageFn);
        r.insert("skippy", stage_skip as StageFn);
        r.insert("boom", stage_boom as StageFn);
        r
    }

    #[test]
    fn merges_in_order_and_reports() {
        let (state, report) = kernel_step(&json!({"seed": 1}), &registry(), &["a", "b"]);
        assert_eq!(state["seed"], json!(1));
        assert_eq!(state["a"]["hit"], json!(true));
        assert_eq!(state["b"]["saw_a"], json!(true));
        assert_eq!(report.ran, vec!["a", "b"]);
        assert_eq!(report.status, Status::Ok);
    }

    #[test]
    fn missing_entries_skip_silently() {
        let (_, report) = kernel_step(&json!({}), &registry(), &["nope", "a"]);
        assert_eq!(report.skipped, vec!["nope"]);
        assert_eq!(report.ran, vec!["a"]);
        assert_eq!(report.status, Status::Ok);
    }

    #[test]
    fn failures_are_isolated() {
        let (state, report) = kernel_step(&json!({}), &registry(), &["boom", "a"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].step, "boom");
        assert_eq!(report.status, Status::Fail);
        // The stage after the failure still ran and merged.
        assert_eq!(state["a"]["hit"], json!(true));
    }

    #[test]
    fn skip_outcomes_are_observable() {
        let (state, report) = kernel_step(&json!({}), &registry(), &["skippy"]);
        assert_eq!(report.skipped, vec!["skippy"]);
        assert_eq!(state, json!({}));
    }

    #[test]
    fn composition_is_deterministic() {
        let seed = json!({"session": {"thread_id": "t-1"}});
        let order = ["a", "skippy", "b", "boom"];
        let (s1, r1) = kernel_step(&seed, &registry(), &order);
        let (s2, r2) = kernel_step(&seed, &registry(), &order);
        assert_eq!(s1, s2);
        assert_eq!(r1.ran, r2.ran);
        assert_eq!(r1.skipped, r2.skipped);
        assert_eq!(r1.errors, r2.errors);
    }
}
