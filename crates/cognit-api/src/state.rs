use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{Value, json};

use cognit_drivers::{
    BlockingTimer, Drivers, LocalSkillRunner, OutboxTransport, SqliteStorage,
};
use cognit_runtime::{CognitConfig, SessionStore, TickReport, run_tick, run_turn};
use cognit_types::{content_hash, deep_merge, get_path};

/// Shared server state: the session store, the local driver stack (with the
/// concrete transport/storage handles the facade needs), and per-session
/// tick locks.
pub struct AppState {
    pub config: CognitConfig,
    pub sessions: SessionStore,
    pub transport: Arc<OutboxTransport>,
    pub skills: Arc<LocalSkillRunner>,
    pub storage: Arc<SqliteStorage>,
    drivers: Drivers,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(config: CognitConfig) -> Result<Arc<Self>> {
        let sessions = if config.session_db_path.as_os_str() == ":memory:" {
            SessionStore::open_in_memory()?
        } else {
            SessionStore::open(&config.session_db_path)?
        };
        let storage = if config.db_path.as_os_str() == ":memory:" {
            Arc::new(SqliteStorage::open_in_memory()?)
        } else {
            Arc::new(SqliteStorage::open(&config.db_path)?)
        };
        let transport = Arc::new(OutboxTransport::new());
        let skills = LocalSkillRunner::with_dev_skills();
        let drivers = Drivers {
            transport: transport.clone(),
            skills: skills.clone(),
            storage: storage.clone(),
            timer: Arc::new(BlockingTimer),
        };
        Ok(Arc::new(AppState {
            config,
            sessions,
            transport,
            skills,
            storage,
            drivers,
            locks: Mutex::new(HashMap::new()),
        }))
    }

    pub fn in_memory() -> Result<Arc<Self>> {
        let mut config = CognitConfig::default();
        config.db_path = ":memory:".into();
        config.session_db_path = ":memory:".into();
        Self::new(config)
    }

    fn session_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("locks lock")
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load (or create) the session, seeding the initial policy config and a
    /// staged version so the very first tick activates a runtime config.
    pub fn ensure_session(&self, thread_id: &str) -> Result<Value> {
        let mut state = self.sessions.ensure(thread_id)?;
        if get_path(&state, &["policy", "current"]).is_none() {
            let policy = self.config.initial_policy();
            let version_id = content_hash(&json!({"parent": null, "config": &policy}));
            deep_merge(
                &mut state,
                json!({
                    "policy": {
                        "current": policy,
                        "apply_stage": {
                            "version": {"id": version_id, "parent_id": null},
                            "doc": {"config": policy},
                        },
                    },
                }),
            );
            if !self.config.agent_aliases.is_empty() {
                deep_merge(
                    &mut state,
                    json!({"session": {"agent_aliases": self.config.agent_aliases}}),
                );
            }
            self.sessions.update(thread_id, &state)?;
        }
        Ok(state)
    }

    /// Run one bare tick for the session, serialized against other ticks on
    /// the same thread.
    pub fn tick_session(&self, thread_id: &str) -> Result<(Value, TickReport)> {
        let lock = self.session_lock(thread_id);
        let _guard = lock.lock().expect("session tick lock");
        let state = self.ensure_session(thread_id)?;
        let (next, report) = run_tick(&state, &self.drivers);
        self.sessions.update(thread_id, &next)?;
        Ok((next, report))
    }

    /// Run a full turn (message events + tick) for the session.
    pub fn turn_session(
        &self,
        thread_id: &str,
        events: Vec<Value>,
    ) -> Result<(Value, TickReport)> {
        let lock = self.session_lock(thread_id);
        let _guard = lock.lock().expect("session tick lock");
        let state = self.ensure_session(thread_id)?;
        let (next, report) = run_turn(&state, events, &self.drivers)?;
        self.sessions.update(thread_id, &next)?;
        Ok((next, report))
    }

    /// Mutate the session state under the session lock, then run one tick.
    pub fn with_session_tick<F>(&self, thread_id: &str, mutate: F) -> Result<(Value, TickReport)>
    where
        F: FnOnce(&mut Value),
    {
        let lock = self.session_lock(thread_id);
        let _guard = lock.lock().expect("session tick lock");
        let mut state = self.ensure_session(thread_id)?;
        mutate(&mut state);
        let (next, report) = run_tick(&state, &self.drivers);
        self.sessions.update(thread_id, &next)?;
        Ok((next, report))
    }

    /// Deliver a message straight to the session's transport channel,
    /// outside the cognitive loop (command replies, fact answers).
    pub fn say(&self, thread_id: &str, text: &str) -> Result<()> {
        use cognit_drivers::TransportDriver;
        // The outbox offset keys repeated identical texts apart.
        let seq = self.transport.len();
        let message = json!({
            "id": content_hash(&json!({"channel": thread_id, "text": text, "seq": seq})),
            "role": "assistant",
            "move": "answer",
            "text": text,
        });
        let frame = json!({
            "type": "transport",
            "channel": thread_id,
            "messages": [message],
            "deadline_ms": 8000,
            "idempotency_key": content_hash(&json!({"say": thread_id, "text": text, "seq": seq})),
        });
        self.transport.emit(&frame)?;
        Ok(())
    }
}
