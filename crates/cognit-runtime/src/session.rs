use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};

/// SQLite-backed session-state store with a write-through in-memory cache.
/// Each thread owns exactly one state tree; first reference creates it.
pub struct SessionStore {
    conn: Mutex<Connection>,
    cache: Mutex<HashMap<String, Value>>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open session store: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = SessionStore {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SessionStore {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("session lock");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                thread_id  TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            "#,
        )?;
        Ok(())
    }

    fn fresh_state(thread_id: &str) -> Value {
        json!({
            "session": {"thread_id": thread_id},
            // Transport frames for this session address its own channel.
            "endpoints": {"transport": {"channel": thread_id}},
        })
    }

    /// Load the session state, creating it on first reference.
    pub fn ensure(&self, thread_id: &str) -> Result<Value> {
        if let Some(state) = self.cache.lock().expect("cache lock").get(thread_id) {
            return Ok(state.clone());
        }
        let loaded: Option<String> = {
            let conn = self.conn.lock().expect("session lock");
            conn.query_row(
                "SELECT state_json FROM session_state WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let state = match loaded {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session state for {thread_id}"))?,
            None => Self::fresh_state(thread_id),
        };
        self.cache
            .lock()
            .expect("cache lock")
            .insert(thread_id.to_string(), state.clone());
        Ok(state)
    }

    pub fn update(&self, thread_id: &str, state: &Value) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        {
            let conn = self.conn.lock().expect("session lock");
            conn.execute(
                "INSERT INTO session_state (thread_id, state_json, updated_at)
                 VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
                 ON CONFLICT(thread_id) DO UPDATE SET
                     state_json = excluded.state_json,
                     updated_at = excluded.updated_at",
                params![thread_id, raw],
            )?;
        }
        self.cache
            .lock()
            .expect("cache lock")
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    pub fn list_threads(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("session lock");
        let mut stmt = conn.prepare(
            "SELECT thread_id, updated_at FROM session_state
             ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every known session, cache-fresh entries winning over disk.
    pub fn all(&self) -> Result<HashMap<String, Value>> {
        let mut sessions: HashMap<String, Value> = HashMap::new();
        {
            let conn = self.conn.lock().expect("session lock");
            let mut stmt = conn.prepare("SELECT thread_id, state_json FROM session_state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (tid, raw) = row?;
                if let Ok(state) = serde_json::from_str(&raw) {
                    sessions.insert(tid, state);
                }
            }
        }
        for (tid, state) in self.cache.lock().expect("cache lock").iter() {
            sessions.insert(tid.clone(), state.clone());
        }
        Ok(sessions)
    }
}
