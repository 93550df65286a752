//! Engine configuration, loaded from YAML. Every field has a default, so an
//! empty document is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum agenda operations per unit of work.
    pub agenda_limit: usize,
    /// Re-runs of a command after a write conflict before it is surfaced.
    pub write_conflict_retries: u32,
    /// Ids reserved per store round-trip.
    pub id_block_size: u64,
    /// Reject deployments naming custom behaviors that are not registered.
    pub strict_behaviors: bool,
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agenda_limit: 10_000,
            write_conflict_retries: 3,
            id_block_size: 100,
            strict_behaviors: true,
            job_executor: JobExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not a map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

// ---------------------------------------------------------------------------
// JobExecutorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Lock owner written on acquired jobs. Generated when absent.
    pub node_id: Option<String>,
    pub lease_ms: i64,
    /// Jobs locked per acquisition.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Batches executing at once.
    pub max_concurrent: usize,
    /// Retries given to newly created jobs.
    pub default_retries: u32,
    /// Delay before a failed job becomes due again.
    pub retry_backoff_ms: i64,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            lease_ms: 300_000,
            batch_size: 10,
            poll_interval_ms: 1_000,
            max_concurrent: 4,
            default_retries: 3,
            retry_backoff_ms: 10_000,
        }
    }
}

impl JobExecutorConfig {
    pub fn resolved_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::now_v7()))
    }
}
