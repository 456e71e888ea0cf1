use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning, read from the `[engine]` section of the server config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Process-wide cap on concurrently executing nodes, across all runs
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-run cap; unbounded when absent
    #[serde(default)]
    pub max_concurrency_per_run: Option<usize>,

    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Attempts per node, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Buffered events per subscriber before progress events are dropped
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Finished runs kept in memory for status queries
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_max_workers() -> usize {
    64
}

fn default_node_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

fn default_retained_runs() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_concurrency_per_run: None,
            node_timeout_secs: default_node_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            event_buffer: default_event_buffer(),
            retained_runs: default_retained_runs(),
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}
