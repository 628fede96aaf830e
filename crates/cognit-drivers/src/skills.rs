use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, mpsc};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Value, json};

use crate::SkillsDriver;
use crate::dedupe::{ReplyCache, idempotency_key};

const REPLY_CACHE_CAPACITY: usize = 256;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A registered skill: params in, result out. Results that are JSON objects
/// or arrays surface as `data`; anything else becomes `text`.
pub type SkillFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Local skill registry with per-call timeouts. Each call runs on its own
/// worker thread and is abandoned once `timeout_ms` elapses; the reply then
/// reports the call as failed.
pub struct LocalSkillRunner {
    registry: RwLock<HashMap<String, SkillFn>>,
    seen: Mutex<ReplyCache>,
}

impl LocalSkillRunner {
    pub fn new() -> Self {
        LocalSkillRunner {
            registry: RwLock::new(HashMap::new()),
            seen: Mutex::new(ReplyCache::new(REPLY_CACHE_CAPACITY)),
        }
    }

    /// Registry preloaded with the dev skills the chat loop exercises. The
    /// ingest/search pair shares a small in-memory document list.
    pub fn with_dev_skills() -> Arc<Self> {
        let runner = Arc::new(Self::new());
        let documents: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

        runner.register("skill.dev.echo", Arc::new(|params: &Value| {
            Ok(json!({"echo": params}))
        }));

        let ingest_docs = Arc::clone(&documents);
        runner.register(
            "skill.dev.ingest",
            Arc::new(move |params: &Value| {
                let text = params.get("text").and_then(|t| t.as_str()).unwrap_or("");
                if text.trim().is_empty() {
                    anyhow::bail!("empty text");
                }
                let mut docs = ingest_docs.lock().expect("ingest lock");
                let doc_id = params
                    .get("id")
                    .and_then(|i| i.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("doc:{}", docs.len() + 1));
                docs.push((doc_id.clone(), text.to_string()));
                Ok(json!({"ok": true, "id": doc_id, "count": docs.len()}))
            }),
        );

        let search_docs = Arc::clone(&documents);
        runner.register(
            "skill.dev.search",
            Arc::new(move |params: &Value| {
                let query = params.get("q").and_then(|q| q.as_str()).unwrap_or("");
                let k = params.get("k").and_then(|k| k.as_u64()).unwrap_or(5) as usize;
                let docs = search_docs.lock().expect("ingest lock");
                let mut scored: Vec<(f64, &(String, String))> = docs
                    .iter()
                    .map(|doc| (overlap_score(query, &doc.1), doc))
                    .filter(|(score, _)| *score > 0.0)
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                let hits: Vec<Value> = scored
                    .iter()
                    .take(k)
                    .map(|(score, (id, text))| {
                        json!({"id": id, "score": score, "snippet": snippet(text, 200)})
                    })
                    .collect();
                Ok(json!({"hits": hits}))
            }),
        );

        runner.register("skill.dev.reward", Arc::new(|params: &Value| {
            Ok(json!({"reward": {
                "score": params.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                "reason": params.get("reason").and_then(|r| r.as_str()).unwrap_or(""),
            }}))
        }));

        runner
    }

    pub fn register(&self, skill_id: &str, skill: SkillFn) {
        self.registry
            .write()
            .expect("registry lock")
            .insert(skill_id.to_string(), skill);
    }

    pub fn skill_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().expect("registry lock").keys().cloned().collect();
        ids.sort();
        ids
    }

    fn run_call(&self, call: &Value, timeout_ms: u64) -> Value {
        let req_id = call.get("req_id").cloned().unwrap_or(Value::Null);
        let skill_id = call.get("skill_id").and_then(|s| s.as_str()).unwrap_or("");
        let params = call.get("params").cloned().unwrap_or_else(|| json!({}));

        let skill = self.registry.read().expect("registry lock").get(skill_id).cloned();
        let started = Instant::now();
        let outcome: Result<Value> = match skill {
            None => Err(anyhow::anyhow!("unknown skill: {skill_id}")),
            Some(skill) => {
                let (tx, rx) = mpsc::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(skill(&params));
                });
                match rx.recv_timeout(Duration::from_millis(timeout_ms.max(1))) {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("skill timed out after {timeout_ms}ms")),
                }
            }
        };
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                let (kind, text, data) = match &result {
                    Value::Object(_) | Value::Array(_) => ("json", String::new(), result.clone()),
                    other => ("text", render_plain(other), Value::Null),
                };
                json!({
                    "ok": true,
                    "req_id": req_id,
                    "kind": kind,
                    "text": text,
                    "data": data,
                    "usage": {"cost": 0.0, "input_tokens": 0, "output_tokens": 0},
                    "latency_ms": latency_ms,
                    "score": 0.0,
                    "attachments": [],
                })
            }
            Err(e) => {
                tracing::warn!(skill_id = %skill_id, error = %e, "skill call failed");
                json!({
                    "ok": false,
                    "req_id": req_id,
                    "kind": "text",
                    "text": format!("error: {e}"),
                    "data": null,
                    "usage": {"cost": 0.0, "input_tokens": 0, "output_tokens": 0},
                    "latency_ms": latency_ms,
                    "score": 0.0,
                    "attachments": [],
                })
            }
        }
    }
}

impl Default for LocalSkillRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn render_plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn overlap_score(query: &str, text: &str) -> f64 {
    let qw: std::collections::HashSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 1)
        .map(str::to_string)
        .collect();
    let tw: std::collections::HashSet<String> = text
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 1)
        .map(str::to_string)
        .collect();
    if qw.is_empty() || tw.is_empty() {
        return 0.0;
    }
    let inter = qw.intersection(&tw).count() as f64;
    inter / ((qw.len() as f64).sqrt() * (tw.len() as f64).sqrt())
}

fn snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max).collect();
        s.push('…');
        s
    }
}

impl SkillsDriver for LocalSkillRunner {
    fn execute(&self, frame: &Value) -> Result<Value> {
        let key = idempotency_key(frame);
        if let Some(reply) = self.seen.lock().expect("seen lock").get(&key) {
            tracing::debug!(idempotency_key = %key, "coalescing duplicate skills batch");
            return Ok(reply);
        }

        let timeout_ms = frame
            .pointer("/limits/timeout_ms")
            .and_then(|t| t.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let calls: Vec<&Value> = frame
            .get("calls")
            .and_then(|c| c.as_array())
            .map(|c| c.iter().filter(|x| x.is_object()).collect())
            .unwrap_or_default();

        let results: Vec<Value> = calls.iter().map(|call| self.run_call(call, timeout_ms)).collect();
        let ok = results
            .iter()
            .all(|r| r.get("ok").and_then(|b| b.as_bool()).unwrap_or(false));

        let reply = json!({"type": "skills", "ok": ok, "calls": results});
        // Only fully-successful batches coalesce; a retry reusing the same
        // idempotency key must be able to re-run its failed calls.
        if ok {
            self.seen.lock().expect("seen lock").put(&key, reply.clone());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_for(calls: Value, key: &str) -> Value {
        json!({
            "type": "skills",
            "calls": calls,
            "limits": {"timeout_ms": 2000, "max_inflight": 2},
            "defer": [],
            "deadline_ms": 5000,
            "idempotency_key": key,
        })
    }

    #[test]
    fn echo_round_trip() {
        let runner = LocalSkillRunner::with_dev_skills();
        let reply = runner
            .execute(&frame_for(
                json!([{"req_id": "r1", "skill_id": "skill.dev.echo", "params": {"msg": "hi"}}]),
                "k1",
            ))
            .unwrap();
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["calls"][0]["data"], json!({"echo": {"msg": "hi"}}));
        assert_eq!(reply["calls"][0]["kind"], json!("json"));
    }

    #[test]
    fn unknown_skill_fails_per_call_not_per_frame() {
        let runner = LocalSkillRunner::with_dev_skills();
        let reply = runner
            .execute(&frame_for(
                json!([
                    {"req_id": "r1", "skill_id": "skill.dev.echo", "params": {}},
                    {"req_id": "r2", "skill_id": "skill.nope", "params": {}},
                ]),
                "k2",
            ))
            .unwrap();
        assert_eq!(reply["ok"], json!(false));
        assert_eq!(reply["calls"][0]["ok"], json!(true));
        assert_eq!(reply["calls"][1]["ok"], json!(false));
        assert!(reply["calls"][1]["text"].as_str().unwrap().contains("unknown skill"));
    }

    #[test]
    fn slow_skills_time_out() {
        let runner = LocalSkillRunner::new();
        runner.register(
            "skill.slow",
            Arc::new(|_params: &Value| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(json!({"done": true}))
            }),
        );
        let frame = json!({
            "type": "skills",
            "calls": [{"req_id": "r1", "skill_id": "skill.slow", "params": {}}],
            "limits": {"timeout_ms": 50, "max_inflight": 1},
            "idempotency_key": "slow-1",
        });
        let reply = runner.execute(&frame).unwrap();
        assert_eq!(reply["calls"][0]["ok"], json!(false));
        assert!(reply["calls"][0]["text"].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn ingest_then_search_finds_documents() {
        let runner = LocalSkillRunner::with_dev_skills();
        runner
            .execute(&frame_for(
                json!([{"req_id": "r1", "skill_id": "skill.dev.ingest",
                        "params": {"id": "d1", "text": "rust borrow checker rules"}}]),
                "k3",
            ))
            .unwrap();
        let reply = runner
            .execute(&frame_for(
                json!([{"req_id": "r2", "skill_id": "skill.dev.search",
                        "params": {"q": "borrow checker", "k": 3}}]),
                "k4",
            ))
            .unwrap();
        let hits = reply["calls"][0]["data"]["hits"].as_array().unwrap();
        assert_eq!(hits[0]["id"], json!("d1"));
    }

    #[test]
    fn duplicate_batches_coalesce() {
        let runner = LocalSkillRunner::with_dev_skills();
        let f = frame_for(
            json!([{"req_id": "r1", "skill_id": "skill.dev.ingest", "params": {"text": "only once"}}]),
            "same",
        );
        let r1 = runner.execute(&f).unwrap();
        let r2 = runner.execute(&f).unwrap();
        assert_eq!(r1, r2);
        // The effect applied once: a second distinct ingest lands at count 2.
        let r3 = runner
            .execute(&frame_for(
                json!([{"req_id": "r2", "skill_id": "skill.dev.ingest", "params": {"text": "another"}}]),
                "different",
            ))
            .unwrap();
        assert_eq!(r3["calls"][0]["data"]["count"], json!(2));
    }
}
