use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cognit_state.db")
}

fn default_session_db_path() -> PathBuf {
    PathBuf::from("cognit_sessions.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrails {
    /// Uncertainty at or above this requires confirmation before acting.
    #[serde(default = "Guardrails::default_u_threshold")]
    pub must_confirm_u_threshold: f64,
    /// SLO score below which execution is blocked; zero disables the block.
    #[serde(default)]
    pub block_execute_slo_below: f64,
    #[serde(default = "Guardrails::default_latency_soft_limit_ms")]
    pub latency_soft_limit_ms: i64,
    #[serde(default = "Guardrails::default_index_queue_soft_max")]
    pub index_queue_soft_max: i64,
}

impl Guardrails {
    fn default_u_threshold() -> f64 {
        0.4
    }
    fn default_latency_soft_limit_ms() -> i64 {
        1500
    }
    fn default_index_queue_soft_max() -> i64 {
        1000
    }
}

impl Default for Guardrails {
    fn default() -> Self {
        Guardrails {
            must_confirm_u_threshold: Self::default_u_threshold(),
            block_execute_slo_below: 0.0,
            latency_soft_limit_ms: Self::default_latency_soft_limit_ms(),
            index_queue_soft_max: Self::default_index_queue_soft_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorLimits {
    #[serde(default = "ExecutorLimits::default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "ExecutorLimits::default_max_inflight")]
    pub max_inflight: i64,
}

impl ExecutorLimits {
    fn default_timeout_ms() -> i64 {
        30_000
    }
    fn default_max_inflight() -> i64 {
        4
    }
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        ExecutorLimits {
            timeout_ms: Self::default_timeout_ms(),
            max_inflight: Self::default_max_inflight(),
        }
    }
}

/// Runtime configuration, loaded from TOML with env-var overrides for the
/// database locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_session_db_path")]
    pub session_db_path: PathBuf,
    #[serde(default)]
    pub agent_aliases: Vec<String>,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub executor: ExecutorLimits,
}

impl Default for CognitConfig {
    fn default() -> Self {
        CognitConfig {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            session_db_path: default_session_db_path(),
            agent_aliases: Vec::new(),
            guardrails: Guardrails::default(),
            executor: ExecutorLimits::default(),
        }
    }
}

impl CognitConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("invalid config: {}", path.display()))?
        } else {
            Self::default()
        };
        if let Ok(db) = std::env::var("COGNIT_DB") {
            config.db_path = PathBuf::from(db);
        }
        if let Ok(db) = std::env::var("COGNIT_SESSION_DB") {
            config.session_db_path = PathBuf::from(db);
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The seed policy config a fresh session starts from; the adaptation
    /// chain versions its own successors from here.
    pub fn initial_policy(&self) -> Value {
        json!({
            "guardrails": {
                "must_confirm": {"u_threshold": self.guardrails.must_confirm_u_threshold},
                "block_execute_when": {"slo_below": self.guardrails.block_execute_slo_below},
                "latency_soft_limit_ms": self.guardrails.latency_soft_limit_ms,
                "index_queue_soft_max": self.guardrails.index_queue_soft_max,
            },
            "executor": {
                "timeout_ms": self.executor.timeout_ms,
                "parallelism": {"max_inflight": self.executor.max_inflight},
            },
            "dialog": {"surface": {"max_len": 800}},
            "safety_filter": {"max_out_len": 1200},
            "features": {},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CognitConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.guardrails.must_confirm_u_threshold, 0.4);
        assert_eq!(config.executor.timeout_ms, 30_000);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cognit.toml");
        let mut config = CognitConfig::default();
        config.bind_addr = "0.0.0.0:9999".to_string();
        config.agent_aliases = vec!["robo".to_string()];
        config.save_to(&path).unwrap();
        let loaded = CognitConfig::load_from(&path).unwrap();
        assert_eq!(loaded.bind_addr, "0.0.0.0:9999");
        assert_eq!(loaded.agent_aliases, vec!["robo"]);
    }

    #[test]
    fn initial_policy_mirrors_guardrails() {
        let config = CognitConfig::default();
        let policy = config.initial_policy();
        assert_eq!(
            policy["guardrails"]["must_confirm"]["u_threshold"],
            serde_json::json!(0.4)
        );
        assert_eq!(policy["executor"]["timeout_ms"], serde_json::json!(30_000));
    }
}
