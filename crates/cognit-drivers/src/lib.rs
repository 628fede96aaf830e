mod dedupe;
mod skills;
mod storage;
mod timer;
mod transport;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

pub use skills::{LocalSkillRunner, SkillFn};
pub use storage::SqliteStorage;
pub use timer::BlockingTimer;
pub use transport::{OutboxEntry, OutboxTransport};

/// Outbound message delivery. The reply echoes the delivered messages.
pub trait TransportDriver: Send + Sync {
    fn emit(&self, frame: &Value) -> Result<Value>;
}

/// Skill batch execution. Per-call failures are reported inside the reply,
/// not as driver errors.
pub trait SkillsDriver: Send + Sync {
    fn execute(&self, frame: &Value) -> Result<Value>;
}

/// Key-value apply plus full-text index in one transactional unit.
pub trait StorageDriver: Send + Sync {
    fn apply_index(&self, frame: &Value) -> Result<Value>;
}

/// Bounded blocking sleep.
pub trait TimerDriver: Send + Sync {
    fn sleep(&self, frame: &Value) -> Result<Value>;
}

/// The driver set handed to the I/O tick. Dispatch selects the handler by
/// the frame's `type`.
#[derive(Clone)]
pub struct Drivers {
    pub transport: Arc<dyn TransportDriver>,
    pub skills: Arc<dyn SkillsDriver>,
    pub storage: Arc<dyn StorageDriver>,
    pub timer: Arc<dyn TimerDriver>,
}

impl Drivers {
    /// The local stack: in-memory outbox, local skill registry with dev
    /// skills, SQLite storage at `db_path` (':memory:' for tests), blocking
    /// timer.
    pub fn local(db_path: &str) -> Result<Drivers> {
        let storage = if db_path == ":memory:" {
            SqliteStorage::open_in_memory()?
        } else {
            SqliteStorage::open(std::path::Path::new(db_path))?
        };
        Ok(Drivers {
            transport: Arc::new(OutboxTransport::new()),
            skills: LocalSkillRunner::with_dev_skills(),
            storage: Arc::new(storage),
            timer: Arc::new(BlockingTimer),
        })
    }
}
