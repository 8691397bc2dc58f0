use crate::core::{DEFAULT_REGION, RegionId, Result, TetherError};
use crate::storage::{DEFAULT_REFRESH_INTERVAL, FlushPolicy};
use crate::summon::{DEFAULT_MAX_ATTEMPTS, SummonPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine settings.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: SummonPolicy,

    /// Ticks between re-snapshots of one record.
    pub refresh_interval_ticks: u64,

    /// Host ticks between two engine passes.
    pub tick_interval: u64,

    /// Retry budget of a deferred summon.
    pub max_attempts: u32,

    pub flush: FlushPolicy,

    /// Directory under the host's persistent-state root.
    pub data_dir: PathBuf,

    pub file_name: String,

    /// Region assumed for stored entries that carry none.
    pub default_region: RegionId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: SummonPolicy::default(),
            refresh_interval_ticks: DEFAULT_REFRESH_INTERVAL,
            tick_interval: 20,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            flush: FlushPolicy::Immediate,
            data_dir: PathBuf::from("data"),
            file_name: "tether_bound_entities.bin".to_string(),
            default_region: RegionId::from(DEFAULT_REGION),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| TetherError::ConfigError(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval == 0 {
            return Err(TetherError::ConfigError("tick_interval must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(TetherError::ConfigError("max_attempts must be at least 1".to_string()));
        }
        if self.file_name.trim().is_empty() {
            return Err(TetherError::ConfigError("file_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Location of the durable file under `state_root`.
    pub fn durable_path(&self, state_root: &Path) -> PathBuf {
        state_root.join(&self.data_dir).join(&self.file_name)
    }

    pub fn policy(mut self, policy: SummonPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn refresh_interval_ticks(mut self, ticks: u64) -> Self {
        self.refresh_interval_ticks = ticks;
        self
    }

    pub fn tick_interval(mut self, ticks: u64) -> Self {
        self.tick_interval = ticks;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }
}
