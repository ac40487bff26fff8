//! Breaker configuration.
//!
//! Defaults are read from a per-user config file. Environment variables
//! override any stored values so managed deployments can force a breaker
//! to start disabled. The start state is an input only: toggling a breaker
//! at runtime never writes it back.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

const CONFIG_ENV: &str = "DBREAKER_CONFIG";
const START_DISABLED_ENV: &str = "DBREAKER_START_DISABLED";
const MAX_IDLE_ENV: &str = "DBREAKER_MAX_IDLE";
const ACQUIRE_TIMEOUT_ENV: &str = "DBREAKER_ACQUIRE_TIMEOUT_MS";

/// Options for a `ConnectionPool`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Idle connections kept for reuse; extras are closed on release
    pub max_idle: usize,
    /// Upper bound on opening one new connection
    pub acquire_timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: 2,
            acquire_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub start_disabled: bool,
    /// Options for the native pool handles a breaker opens
    pub pool: PoolOptions,
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .unwrap_or_default();
    let mut path = PathBuf::from(home);
    path.push(".dbreaker");
    path.push("config.json");
    path
}

impl BreakerConfig {
    /// Loads the config file (if any) and applies environment overrides
    pub fn load() -> Self {
        let mut config = Self::load_from(&config_path()).unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn load_from(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::config(format!("Invalid config {}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::config(format!("Save failed: {}", e)))?;
        fs::write(path, payload).map_err(|e| EngineError::config(format!("Save failed: {}", e)))
    }

    /// Applies overrides looked up by environment variable name
    ///
    /// Unparsable numbers are ignored and keep the stored value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(START_DISABLED_ENV) {
            self.start_disabled = parse_bool(&value);
        }
        if let Some(value) = lookup(MAX_IDLE_ENV).and_then(|v| v.trim().parse().ok()) {
            self.pool.max_idle = value;
        }
        if let Some(value) = lookup(ACQUIRE_TIMEOUT_ENV).and_then(|v| v.trim().parse().ok()) {
            self.pool.acquire_timeout_ms = value;
        }
    }
}
