//! Execution configuration
//!
//! Defaults suit an embedded engine; deployments override them through
//! `PHOTONQ_*` environment variables or a TOML file.

use crate::datastore::ScanConsistency;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables of the execution core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Capacity of the row channel between operators
    pub pipeline_cap: usize,

    /// Capacity of the entry channel between a scan and its index
    pub index_conn_cap: usize,

    /// Rows counted locally before flushing to the shared phase counters
    pub phase_update_count: u64,

    /// Largest span set a dynamic IN list may expand into
    pub full_span_fanout: usize,

    /// Free-list capacity of each operator pool
    pub operator_pool_size: usize,

    pub scan_consistency: ScanConsistency,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            pipeline_cap: 512,
            index_conn_cap: 256,
            phase_update_count: 1024,
            full_span_fanout: 8192,
            operator_pool_size: 1024,
            scan_consistency: ScanConsistency::NotBounded,
        }
    }
}

impl ExecConfig {
    /// Read overrides from `PHOTONQ_*` variables; unset or unparsable
    /// variables keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let scan_consistency = match std::env::var("PHOTONQ_SCAN_CONSISTENCY")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "at_plus" => ScanConsistency::AtPlus,
            "request_plus" => ScanConsistency::RequestPlus,
            _ => defaults.scan_consistency,
        };

        Self {
            pipeline_cap: env_or("PHOTONQ_PIPELINE_CAP", defaults.pipeline_cap),
            index_conn_cap: env_or("PHOTONQ_INDEX_CONN_CAP", defaults.index_conn_cap),
            phase_update_count: env_or("PHOTONQ_PHASE_UPDATE_COUNT", defaults.phase_update_count),
            full_span_fanout: env_or("PHOTONQ_FULL_SPAN_FANOUT", defaults.full_span_fanout),
            operator_pool_size: env_or("PHOTONQ_OPERATOR_POOL_SIZE", defaults.operator_pool_size),
            scan_consistency,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline_cap == 0 {
            return Err(Error::Config("pipeline_cap must be positive".into()));
        }
        if self.index_conn_cap == 0 {
            return Err(Error::Config("index_conn_cap must be positive".into()));
        }
        if self.phase_update_count == 0 {
            return Err(Error::Config("phase_update_count must be positive".into()));
        }
        if self.full_span_fanout == 0 {
            return Err(Error::Config("full_span_fanout must be positive".into()));
        }
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
