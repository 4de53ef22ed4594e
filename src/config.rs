//! Runtime tuning knobs, loadable from TOML.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{NimbusError, Result};

/// Tuning parameters for a nimbus worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of threads executing checked-out computations.
    pub worker_threads: usize,
    /// Number of threads backing the callback scheduler used for event fanout.
    pub callback_threads: usize,
    /// Maximum number of state-log writers held open at once.
    pub max_open_files: usize,
    /// Interval between background state-log flush passes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Wall-clock budget for a single computed-graph flush, in milliseconds.
    /// `None` flushes to quiescence.
    pub graph_flush_budget_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            callback_threads: 2,
            max_open_files: 256,
            flush_interval_ms: 1000,
            graph_flush_budget_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Parses a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| NimbusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(NimbusError::Config("worker_threads must be nonzero".into()));
        }
        if self.max_open_files == 0 {
            return Err(NimbusError::Config("max_open_files must be nonzero".into()));
        }
        Ok(())
    }
}
