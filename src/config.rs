// src/config.rs

//! Manages orchestrator configuration: loading, validation, and defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

/// Tunables for the rebalance and failover machinery. Every external wait the
/// orchestrator performs is bounded by one of these timeouts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum time to wait for a bucket to become ready on a set of nodes.
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// Timeout for a single engine `query_states` call.
    #[serde(default = "default_query_states_timeout_secs")]
    pub query_states_timeout_secs: u64,

    /// Timeout for propagating a config change to remote nodes.
    #[serde(default = "default_apply_config_timeout_secs")]
    pub apply_config_timeout_secs: u64,

    /// Per-bucket timeout for waiting on excess-bucket shutdown. The total
    /// wait is this value multiplied by the number of buckets involved.
    #[serde(default = "default_buckets_shutdown_timeout_secs")]
    pub buckets_shutdown_timeout_secs: u64,

    /// Maximum concurrent vbucket moves per source-destination node pair.
    #[serde(default = "default_moves_per_node")]
    pub moves_per_node: usize,

    /// Delay after moving vbuckets off a rebalanced-out node, so clients see
    /// graceful not-my-vbucket responses instead of abrupt disconnects.
    #[serde(default = "default_rebalance_out_delay_secs")]
    pub rebalance_out_delay_secs: u64,

    /// Number of committed vbucket maps retained for delta recovery.
    #[serde(default = "default_map_history_limit")]
    pub map_history_limit: usize,

    /// Per-service drain delay applied before ejecting a node that ran the
    /// service. Keyed by service name; the maximum applicable delay wins.
    #[serde(default)]
    pub eject_delay_secs: HashMap<String, u64>,
}

fn default_readiness_timeout_secs() -> u64 {
    60
}
fn default_query_states_timeout_secs() -> u64 {
    10
}
fn default_apply_config_timeout_secs() -> u64 {
    300
}
fn default_buckets_shutdown_timeout_secs() -> u64 {
    20
}
fn default_moves_per_node() -> usize {
    1
}
fn default_rebalance_out_delay_secs() -> u64 {
    10
}
fn default_map_history_limit() -> usize {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: default_readiness_timeout_secs(),
            query_states_timeout_secs: default_query_states_timeout_secs(),
            apply_config_timeout_secs: default_apply_config_timeout_secs(),
            buckets_shutdown_timeout_secs: default_buckets_shutdown_timeout_secs(),
            moves_per_node: default_moves_per_node(),
            rebalance_out_delay_secs: default_rebalance_out_delay_secs(),
            map_history_limit: default_map_history_limit(),
            eject_delay_secs: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads the configuration from a TOML file and validates it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from '{path}'"))?;

        let config: OrchestratorConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would stall or livelock the orchestrator.
    pub fn validate(&self) -> Result<()> {
        if self.moves_per_node == 0 {
            return Err(anyhow!("'moves_per_node' must be at least 1"));
        }
        if self.map_history_limit == 0 {
            return Err(anyhow!("'map_history_limit' must be at least 1"));
        }
        if self.query_states_timeout_secs == 0 || self.readiness_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn query_states_timeout(&self) -> Duration {
        Duration::from_secs(self.query_states_timeout_secs)
    }

    pub fn apply_config_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_config_timeout_secs)
    }

    /// Shutdown wait scaled by the number of buckets being torn down.
    pub fn buckets_shutdown_timeout(&self, bucket_count: usize) -> Duration {
        Duration::from_secs(self.buckets_shutdown_timeout_secs * bucket_count.max(1) as u64)
    }

    pub fn rebalance_out_delay(&self) -> Duration {
        Duration::from_secs(self.rebalance_out_delay_secs)
    }

    /// The longest eject delay that applies to any of the given services.
    pub fn max_eject_delay<'a>(&self, services: impl IntoIterator<Item = &'a str>) -> Duration {
        let secs = services
            .into_iter()
            .filter_map(|s| self.eject_delay_secs.get(s).copied())
            .max()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }
}
