use crate::config::TrackerConfig;
use chrono::{DateTime, Utc};
use confluxcore::{FlowId, FlowStatus, ValidationError, Value};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// Sub-step record inside a flow execution
#[derive(Debug, Clone, Serialize)]
pub struct NodeExecutionRecord {
    pub name: String,
    pub status: FlowStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub executions: u32,
    pub error: Option<String>,
    #[serde(skip)]
    started_at: Instant,
}

/// Everything the tracker knows about one flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowExecutionRecord {
    pub id: FlowId,
    pub status: FlowStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub attempts: u32,
    pub errors: VecDeque<String>,
    pub nodes: BTreeMap<String, NodeExecutionRecord>,
    pub dependencies: BTreeSet<FlowId>,
    pub dependents: BTreeSet<FlowId>,
    pub result: Option<Value>,
    pub cancel_reason: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl FlowExecutionRecord {
    fn new(id: FlowId, metadata: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            status: FlowStatus::Pending,
            start_time: None,
            end_time: None,
            duration: None,
            attempts: 0,
            errors: VecDeque::new(),
            nodes: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            result: None,
            cancel_reason: None,
            metadata,
            started_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration.map(|d| d.as_secs_f64() * 1000.0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bottleneck {
    pub id: FlowId,
    pub duration_ms: f64,
    pub dependents: usize,
}

/// Aggregate statistics over tracked flows. Durations are in milliseconds.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TrackerMetrics {
    pub total_flows: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub sampled_out: usize,
    pub total_errors: usize,
    pub node_executions: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub std_dev_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub bottlenecks: Vec<Bottleneck>,
}

/// Running duration accumulators; mean and variance come from the sums
/// without rescanning history.
#[derive(Debug, Default)]
struct DurationStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: Option<f64>,
    max: Option<f64>,
    samples: VecDeque<f64>,
}

impl DurationStats {
    fn record(&mut self, ms: f64, max_samples: usize) {
        self.count += 1;
        self.sum += ms;
        self.sum_sq += ms * ms;
        self.min = Some(self.min.map_or(ms, |m| m.min(ms)));
        self.max = Some(self.max.map_or(ms, |m| m.max(ms)));

        if max_samples > 0 {
            if self.samples.len() == max_samples {
                self.samples.pop_front();
            }
            self.samples.push_back(ms);
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct / 100.0 * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Records lifecycle timestamps and outcomes of flows and their steps.
///
/// Operations on flows that were sampled out are silent no-ops; operations
/// on flows that were never registered fail with `FlowNotFound`.
pub struct ExecutionTracker {
    config: TrackerConfig,
    records: HashMap<FlowId, FlowExecutionRecord>,
    sampled_out: HashSet<FlowId>,
    durations: DurationStats,
    node_executions: u64,
}

impl ExecutionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            sampled_out: HashSet::new(),
            durations: DurationStats::default(),
            node_executions: 0,
        }
    }

    fn is_sampled(&self, id: &FlowId) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % 10_000) < (rate * 10_000.0) as u64
    }

    /// Start tracking a flow. Returns false when the flow was sampled out.
    pub fn register_flow(&mut self, id: FlowId, metadata: BTreeMap<String, Value>) -> bool {
        if !self.is_sampled(&id) {
            tracing::debug!("Flow {} sampled out of tracking", id);
            self.sampled_out.insert(id);
            return false;
        }
        self.records
            .entry(id.clone())
            .or_insert_with(|| FlowExecutionRecord::new(id, metadata));
        true
    }

    fn record_mut(
        &mut self,
        id: &FlowId,
    ) -> Result<Option<&mut FlowExecutionRecord>, ValidationError> {
        match self.records.get_mut(id) {
            Some(record) => Ok(Some(record)),
            None if self.sampled_out.contains(id) => Ok(None),
            None => Err(ValidationError::FlowNotFound(id.to_string())),
        }
    }

    pub fn add_dependency(
        &mut self,
        dependency: &FlowId,
        dependent: &FlowId,
    ) -> Result<(), ValidationError> {
        if let Some(record) = self.record_mut(dependent)? {
            record.dependencies.insert(dependency.clone());
        }
        if let Some(record) = self.record_mut(dependency)? {
            record.dependents.insert(dependent.clone());
        }
        Ok(())
    }

    /// Mirror a non-terminal scheduler transition (pending / ready).
    pub fn update_status(&mut self, id: &FlowId, status: FlowStatus) -> Result<(), ValidationError> {
        if let Some(record) = self.record_mut(id)? {
            record.status = status;
        }
        Ok(())
    }

    pub fn start_flow_execution(&mut self, id: &FlowId) -> Result<(), ValidationError> {
        if let Some(record) = self.record_mut(id)? {
            record.status = FlowStatus::Running;
            record.start_time = Some(Utc::now());
            record.started_at = Some(Instant::now());
            record.end_time = None;
            record.duration = None;
            record.attempts += 1;
        }
        Ok(())
    }

    pub fn complete_flow_execution(
        &mut self,
        id: &FlowId,
        success: bool,
        result: Option<Value>,
    ) -> Result<(), ValidationError> {
        let max_history = self.config.max_history;
        let Some(record) = self.record_mut(id)? else {
            return Ok(());
        };

        record.status = if success {
            FlowStatus::Completed
        } else {
            FlowStatus::Failed
        };
        record.end_time = Some(Utc::now());
        record.result = result;

        let duration = record.started_at.map(|started| started.elapsed());
        record.duration = duration;
        if let Some(duration) = duration {
            self.durations
                .record(duration.as_secs_f64() * 1000.0, max_history);
        }
        Ok(())
    }

    pub fn cancel_flow_execution(
        &mut self,
        id: &FlowId,
        reason: impl Into<String>,
    ) -> Result<(), ValidationError> {
        if let Some(record) = self.record_mut(id)? {
            record.status = FlowStatus::Cancelled;
            record.end_time = Some(Utc::now());
            record.cancel_reason = Some(reason.into());
        }
        Ok(())
    }

    /// Append an error, dropping the oldest once the per-flow cap is hit.
    pub fn record_error(
        &mut self,
        id: &FlowId,
        error: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let cap = self.config.max_errors_per_flow;
        if let Some(record) = self.record_mut(id)? {
            if cap == 0 {
                return Ok(());
            }
            if record.errors.len() == cap {
                record.errors.pop_front();
            }
            record.errors.push_back(error.into());
        }
        Ok(())
    }

    pub fn start_node(&mut self, id: &FlowId, node: &str) -> Result<(), ValidationError> {
        if let Some(record) = self.record_mut(id)? {
            let executions = record.nodes.get(node).map_or(0, |n| n.executions);
            record.nodes.insert(
                node.to_string(),
                NodeExecutionRecord {
                    name: node.to_string(),
                    status: FlowStatus::Running,
                    start_time: Utc::now(),
                    end_time: None,
                    duration: None,
                    executions: executions + 1,
                    error: None,
                    started_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    pub fn complete_node(
        &mut self,
        id: &FlowId,
        node: &str,
        error: Option<String>,
    ) -> Result<(), ValidationError> {
        let Some(record) = self.record_mut(id)? else {
            return Ok(());
        };
        let Some(node_record) = record.nodes.get_mut(node) else {
            return Err(ValidationError::StepNotFound(node.to_string()));
        };

        node_record.status = if error.is_some() {
            FlowStatus::Failed
        } else {
            FlowStatus::Completed
        };
        node_record.end_time = Some(Utc::now());
        node_record.duration = Some(node_record.started_at.elapsed());
        node_record.error = error;
        self.node_executions += 1;
        Ok(())
    }

    pub fn record(&self, id: &FlowId) -> Option<&FlowExecutionRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &FlowExecutionRecord> {
        self.records.values()
    }

    /// Recorded durations in milliseconds, for critical-path analysis.
    pub fn durations(&self) -> HashMap<FlowId, f64> {
        self.records
            .values()
            .filter_map(|r| r.duration_ms().map(|ms| (r.id.clone(), ms)))
            .collect()
    }

    pub fn get_metrics(&self) -> TrackerMetrics {
        let mut metrics = TrackerMetrics {
            total_flows: self.records.len(),
            sampled_out: self.sampled_out.len(),
            node_executions: self.node_executions,
            total_duration_ms: self.durations.sum,
            avg_duration_ms: self.durations.mean(),
            std_dev_ms: self.durations.std_dev(),
            min_duration_ms: self.durations.min,
            max_duration_ms: self.durations.max,
            ..TrackerMetrics::default()
        };

        for record in self.records.values() {
            match record.status {
                FlowStatus::Pending => metrics.pending += 1,
                FlowStatus::Ready => metrics.ready += 1,
                FlowStatus::Running => metrics.running += 1,
                FlowStatus::Completed => metrics.completed += 1,
                FlowStatus::Failed => metrics.failed += 1,
                FlowStatus::Cancelled => metrics.cancelled += 1,
            }
            metrics.total_errors += record.errors.len();
        }

        if self.config.compute_percentiles && !self.durations.samples.is_empty() {
            let mut sorted: Vec<f64> = self.durations.samples.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            metrics.median_ms = median(&sorted);
            metrics.p90_ms = percentile(&sorted, 90.0);
            metrics.p95_ms = percentile(&sorted, 95.0);
            metrics.p99_ms = percentile(&sorted, 99.0);
        }

        metrics.bottlenecks = self.bottlenecks();
        metrics
    }

    /// Flows with a recorded duration and more than one dependent, longest
    /// first.
    fn bottlenecks(&self) -> Vec<Bottleneck> {
        let mut candidates: Vec<Bottleneck> = self
            .records
            .values()
            .filter(|r| r.dependents.len() > 1)
            .filter_map(|r| {
                r.duration_ms().map(|duration_ms| Bottleneck {
                    id: r.id.clone(),
                    duration_ms,
                    dependents: r.dependents.len(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.duration_ms
                .total_cmp(&a.duration_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(self.config.bottleneck_count);
        candidates
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.sampled_out.clear();
        self.durations = DurationStats::default();
        self.node_executions = 0;
    }
}
