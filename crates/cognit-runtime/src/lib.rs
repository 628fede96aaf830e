mod config;
mod registry;
mod session;
mod tick;

pub use config::CognitConfig;
pub use registry::build_registry;
pub use session::SessionStore;
pub use tick::{TickReport, run_tick, run_tick_at, run_turn, run_turn_at};
