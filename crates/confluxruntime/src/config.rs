use confluxcore::{FlowError, ResourceEstimate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the whole runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub tracker: TrackerConfig,
    pub orchestrator: OrchestratorConfig,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            tracker: TrackerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// Single-flow engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memoize: bool,
    pub cache_ttl_ms: u64,
    /// Purging starts once the table grows past this many entries
    pub cache_max_entries: usize,
    /// Oldest entries are evicted down to this size
    pub cache_floor_entries: usize,
    /// Results whose serialized form is larger than this are never cached
    pub cache_max_entry_bytes: usize,
    pub step_timeout_ms: Option<u64>,
    pub max_step_executions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memoize: true,
            cache_ttl_ms: 5 * 60 * 1000,
            cache_max_entries: 100,
            cache_floor_entries: 50,
            cache_max_entry_bytes: 1024 * 1024,
            step_timeout_ms: None,
            max_step_executions: 1000,
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

/// What the scheduler does when the head of the ready queue cannot be
/// resourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Stop dispatching for this tick; nothing jumps ahead of the blocked flow
    HeadOfLine,
    /// Leave the blocked flow in place and try the flows behind it
    SkipBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub limits: ResourceEstimate,
    pub max_queue_time_ms: u64,
    pub priority_boost: i32,
    pub max_priority: i32,
    pub predictive: bool,
    pub history_window: usize,
    pub default_estimate_ms: f64,
    pub per_dependency_estimate_ms: f64,
    pub backpressure_threshold: f64,
    pub queue_policy: QueuePolicy,
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            limits: ResourceEstimate::new(1.0, 1.0, 1.0, 1.0),
            max_queue_time_ms: 30_000,
            priority_boost: 1,
            max_priority: 100,
            predictive: true,
            history_window: 20,
            default_estimate_ms: 1000.0,
            per_dependency_estimate_ms: 500.0,
            backpressure_threshold: 0.9,
            queue_policy: QueuePolicy::HeadOfLine,
            tick_interval_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn max_queue_time(&self) -> Duration {
        Duration::from_millis(self.max_queue_time_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fraction of flows tracked, between 0.0 and 1.0
    pub sampling_rate: f64,
    pub max_errors_per_flow: usize,
    /// Duration samples kept for percentile computation
    pub max_history: usize,
    pub bottleneck_count: usize,
    pub compute_percentiles: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            max_errors_per_flow: 10,
            max_history: 1000,
            bottleneck_count: 5,
            compute_percentiles: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub flow_timeout_ms: Option<u64>,
    pub execution_timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    pub fn flow_timeout(&self) -> Option<Duration> {
        self.flow_timeout_ms.map(Duration::from_millis)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}
