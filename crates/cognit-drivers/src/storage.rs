use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};

use crate::StorageDriver;
use crate::dedupe::{ReplyCache, idempotency_key};

const REPLY_CACHE_CAPACITY: usize = 256;

// NOTE: Storage layout
//
// - kv(k, v): the generic namespaced store; values are JSON text. Keys are
//   full paths like store/<product>/<thread>/turns/<id>, so one table serves
//   every namespace.
// - fts(doc_id UNINDEXED, text): contentless-style FTS5 table ranked with
//   bm25; upsert is delete+insert because FTS5 has no OR REPLACE.
// - facts(thread_id, k_raw, v_raw, k_norm, created_at): answer overrides,
//   keyed by the normalized question so lookups survive punctuation/case.

/// SQLite storage driver: key-value apply ops, full-text indexing, and the
/// per-thread fact store, all behind one connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    seen: Mutex<ReplyCache>,
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let storage = SqliteStorage {
            conn: Mutex::new(conn),
            seen: Mutex::new(ReplyCache::new(REPLY_CACHE_CAPACITY)),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = SqliteStorage {
            conn: Mutex::new(conn),
            seen: Mutex::new(ReplyCache::new(REPLY_CACHE_CAPACITY)),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("storage lock");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS facts (
                thread_id  TEXT NOT NULL,
                k_raw      TEXT NOT NULL,
                v_raw      TEXT NOT NULL,
                k_norm     TEXT NOT NULL,
                created_at REAL NOT NULL DEFAULT (strftime('%s','now')),
                PRIMARY KEY (thread_id, k_norm)
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS fts USING fts5(doc_id UNINDEXED, text);
            "#,
        )?;
        Ok(())
    }

    // ---------------- kv ----------------

    pub fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().expect("storage lock");
        let raw: Option<String> = conn
            .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    pub fn kv_put(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn.lock().expect("storage lock");
        conn.execute(
            "INSERT INTO kv (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn apply_op(conn: &Connection, op: &Value) -> Result<bool> {
        let Some(key) = op.get("key").and_then(|k| k.as_str()) else {
            return Ok(false);
        };
        match op.get("op").and_then(|o| o.as_str()) {
            Some("put") | Some("link") => {
                let value = op.get("value").cloned().unwrap_or(Value::Null);
                conn.execute(
                    "INSERT INTO kv (k, v) VALUES (?1, ?2)
                     ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                    params![key, serde_json::to_string(&value)?],
                )?;
                Ok(true)
            }
            Some("inc") => {
                let delta = op
                    .get("delta")
                    .or_else(|| op.get("value"))
                    .and_then(|d| d.as_i64())
                    .unwrap_or(1);
                let current: Option<String> = conn
                    .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
                    .optional()?;
                let base = current
                    .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                conn.execute(
                    "INSERT INTO kv (k, v) VALUES (?1, ?2)
                     ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                    params![key, (base + delta).to_string()],
                )?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ---------------- full-text index ----------------

    pub fn index_doc(&self, doc_id: &str, text: &str) -> Result<()> {
        let conn = self.conn.lock().expect("storage lock");
        Self::index_doc_on(&conn, doc_id, text)
    }

    fn index_doc_on(conn: &Connection, doc_id: &str, text: &str) -> Result<()> {
        // FTS5 has no upsert; replace by delete + insert.
        conn.execute("DELETE FROM fts WHERE doc_id = ?1", params![doc_id])?;
        conn.execute(
            "INSERT INTO fts (doc_id, text) VALUES (?1, ?2)",
            params![doc_id, text],
        )?;
        Ok(())
    }

    /// BM25-ranked search with bracketed snippets. Lower bm25 is better;
    /// results come back best-first.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Value>> {
        let conn = self.conn.lock().expect("storage lock");
        let mut stmt = conn.prepare(
            "SELECT doc_id, snippet(fts, 1, '[', ']', ' … ', 10), bm25(fts)
             FROM fts WHERE fts MATCH ?1 ORDER BY bm25(fts) LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (doc_id, snippet, score) = row?;
            out.push(json!({"doc_id": doc_id, "snippet": snippet, "score": score}));
        }
        Ok(out)
    }

    fn index_item(conn: &Connection, item: &Value) -> Result<bool> {
        match item.get("type").and_then(|t| t.as_str()) {
            Some("doc") | Some("packz") => {
                let source = item.get("packz").filter(|p| p.is_object()).unwrap_or(item);
                let (Some(id), Some(text)) = (
                    source.get("id").and_then(|i| i.as_str()),
                    source.get("text").and_then(|t| t.as_str()),
                ) else {
                    return Ok(false);
                };
                if text.trim().is_empty() {
                    return Ok(false);
                }
                Self::index_doc_on(conn, id, text)?;
                Ok(true)
            }
            Some("fact") => {
                let (Some(k), Some(v)) = (
                    item.get("k").and_then(|x| x.as_str()),
                    item.get("v").and_then(|x| x.as_str()),
                ) else {
                    return Ok(false);
                };
                let id = item
                    .get("id")
                    .and_then(|i| i.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| cognit_types::text_hash(&format!("{k}={v}")));
                Self::index_doc_on(conn, &id, &format!("{k} = {v}"))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ---------------- fact store ----------------

    pub fn fact_upsert(&self, thread_id: &str, k_raw: &str, v_raw: &str) -> Result<()> {
        let k_norm = normalize_fact_key(k_raw);
        if k_norm.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("storage lock");
        conn.execute(
            "INSERT INTO facts (thread_id, k_raw, v_raw, k_norm, created_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s','now'))
             ON CONFLICT(thread_id, k_norm) DO UPDATE SET
                 k_raw = excluded.k_raw,
                 v_raw = excluded.v_raw,
                 created_at = excluded.created_at",
            params![thread_id, k_raw, v_raw, k_norm],
        )?;
        Ok(())
    }

    pub fn fact_get(&self, thread_id: &str, query_text: &str) -> Result<Option<(String, String)>> {
        let k_norm = normalize_fact_key(query_text);
        if k_norm.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().expect("storage lock");
        Ok(conn
            .query_row(
                "SELECT k_raw, v_raw FROM facts WHERE thread_id = ?1 AND k_norm = ?2 LIMIT 1",
                params![thread_id, k_norm],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    pub fn fact_delete(&self, thread_id: &str, key_text: &str) -> Result<usize> {
        let k_norm = normalize_fact_key(key_text);
        if k_norm.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().expect("storage lock");
        Ok(conn.execute(
            "DELETE FROM facts WHERE thread_id = ?1 AND k_norm = ?2",
            params![thread_id, k_norm],
        )?)
    }

    pub fn fact_list(&self, thread_id: &str, limit: usize) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("storage lock");
        let mut stmt = conn.prepare(
            "SELECT k_raw, v_raw FROM facts WHERE thread_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Collapse punctuation and case so "What is Rust?" and "what is rust" key
/// the same fact.
pub fn normalize_fact_key(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| {
            if matches!(c, '?' | '!' | '.' | ',' | ':' | ';' | '؟' | '،' | '؛') {
                ' '
            } else {
                c
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl StorageDriver for SqliteStorage {
    fn apply_index(&self, frame: &Value) -> Result<Value> {
        let key = idempotency_key(frame);
        if let Some(reply) = self.seen.lock().expect("seen lock").get(&key) {
            tracing::debug!(idempotency_key = %key, "coalescing duplicate storage apply");
            return Ok(reply);
        }

        let apply_ops: Vec<Value> = frame
            .get("apply")
            .map(|a| match a {
                Value::Array(ops) => ops.clone(),
                Value::Object(obj) => obj
                    .get("ops")
                    .and_then(|o| o.as_array())
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            })
            .unwrap_or_default();
        let index_items: Vec<Value> = frame
            .get("index")
            .map(|i| match i {
                Value::Array(items) => items.clone(),
                Value::Object(obj) => obj
                    .get("queue")
                    .and_then(|q| q.as_array())
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        let mut applied: Vec<Value> = Vec::new();
        let mut indexed: Vec<Value> = Vec::new();
        let result: Result<()> = (|| {
            let mut conn = self.conn.lock().expect("storage lock");
            let tx = conn.transaction()?;
            for op in &apply_ops {
                if Self::apply_op(&tx, op)? {
                    applied.push(op.clone());
                }
            }
            for item in &index_items {
                if Self::index_item(&tx, item)? {
                    indexed.push(item.clone());
                }
            }
            tx.commit()?;
            Ok(())
        })();

        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "storage apply failed");
                applied.clear();
                indexed.clear();
                false
            }
        };
        let reply = json!({
            "type": "storage",
            "ok": ok,
            "apply": {"ops": applied},
            "index": {"queue": indexed},
        });
        if ok {
            self.seen.lock().expect("seen lock").put(&key, reply.clone());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    fn apply_frame(apply: Value, index: Value, key: &str) -> Value {
        json!({
            "type": "storage",
            "namespace": "store/cognit/t-1",
            "apply": apply,
            "index": index,
            "deadline_ms": 12000,
            "idempotency_key": key,
        })
    }

    #[test]
    fn put_inc_link_round_trip() {
        let s = storage();
        let reply = s
            .apply_index(&apply_frame(
                json!([
                    {"op": "put", "key": "store/cognit/t-1/turns/u1", "value": {"text": "hi"}},
                    {"op": "inc", "key": "store/cognit/t-1/counters/turns", "delta": 2},
                    {"op": "inc", "key": "store/cognit/t-1/counters/turns", "delta": 3},
                    {"op": "link", "key": "store/cognit/t-1/links/x", "value": {"a": "b"}},
                ]),
                json!([]),
                "k1",
            ))
            .unwrap();
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["apply"]["ops"].as_array().unwrap().len(), 4);
        assert_eq!(
            s.kv_get("store/cognit/t-1/turns/u1").unwrap(),
            Some(json!({"text": "hi"}))
        );
        assert_eq!(
            s.kv_get("store/cognit/t-1/counters/turns").unwrap(),
            Some(json!(5))
        );
    }

    #[test]
    fn indexing_and_bm25_search() {
        let s = storage();
        s.apply_index(&apply_frame(
            json!([]),
            json!([
                {"type": "packz", "id": "d1", "text": "the borrow checker enforces ownership",
                 "ns": "store/cognit/t-1"},
                {"type": "doc", "id": "d2", "text": "gardening tips for spring",
                 "ns": "store/cognit/t-1"},
            ]),
            "k2",
        ))
        .unwrap();
        let hits = s.search("borrow checker", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["doc_id"], json!("d1"));
        assert!(hits[0]["snippet"].as_str().unwrap().contains("[borrow]"));
    }

    #[test]
    fn reindexing_replaces_the_document() {
        let s = storage();
        s.index_doc("d1", "old words entirely").unwrap();
        s.index_doc("d1", "new content here").unwrap();
        assert!(s.search("old", 5).unwrap().is_empty());
        assert_eq!(s.search("content", 5).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_frames_apply_once() {
        let s = storage();
        let frame = apply_frame(
            json!([{"op": "inc", "key": "c/n", "delta": 1}]),
            json!([]),
            "same-key",
        );
        s.apply_index(&frame).unwrap();
        s.apply_index(&frame).unwrap();
        assert_eq!(s.kv_get("c/n").unwrap(), Some(json!(1)));
    }

    #[test]
    fn fact_store_upsert_get_delete() {
        let s = storage();
        s.fact_upsert("t-1", "What is Rust?", "a systems language").unwrap();
        assert_eq!(
            s.fact_get("t-1", "what is rust").unwrap(),
            Some(("What is Rust?".to_string(), "a systems language".to_string()))
        );
        // Per-thread isolation.
        assert_eq!(s.fact_get("t-2", "what is rust").unwrap(), None);
        // Upsert replaces.
        s.fact_upsert("t-1", "what is rust", "updated").unwrap();
        assert_eq!(s.fact_list("t-1", 10).unwrap().len(), 1);
        assert_eq!(s.fact_delete("t-1", "What is Rust").unwrap(), 1);
        assert_eq!(s.fact_get("t-1", "what is rust").unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let s = SqliteStorage::open(&path).unwrap();
            s.kv_put("k/persist", &json!({"x": 1})).unwrap();
        }
        let s = SqliteStorage::open(&path).unwrap();
        assert_eq!(s.kv_get("k/persist").unwrap(), Some(json!({"x": 1})));
    }
}
