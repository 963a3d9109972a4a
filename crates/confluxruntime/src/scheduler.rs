use crate::config::{QueuePolicy, SchedulerConfig};
use crate::predictor::DurationPredictor;
use crate::resources::ResourcePool;
use chrono::Utc;
use confluxcore::{
    EventBus, ExecutionEvent, FlowId, FlowStatus, ResourceEstimate, SchedulerStats,
    ValidationError,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

/// What the scheduler needs to know about a flow at registration
#[derive(Debug, Clone, Default)]
pub struct FlowRegistration {
    /// History bucket for duration predictions; the flow id when absent
    pub flow_type: Option<String>,
    pub priority: i32,
    pub dependencies: Vec<FlowId>,
    pub resources: ResourceEstimate,
}

/// How a dispatched flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Completed,
    Failed,
    /// Dispatched but not run because its condition was false; ends cancelled
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SchedulableFlow {
    pub id: FlowId,
    pub flow_type: String,
    pub base_priority: i32,
    /// Effective priority, including any aging boost
    pub priority: i32,
    pub status: FlowStatus,
    /// Blocked-by index: flows that must complete first
    pub dependencies: BTreeSet<FlowId>,
    /// Blocking index: flows waiting on this one
    pub dependents: BTreeSet<FlowId>,
    pub resources: ResourceEstimate,
    pub attempts: u32,
    pub ready_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub cancel_reason: Option<String>,
    ready_seq: u64,
}

impl SchedulableFlow {
    fn transition_error(&self, to: FlowStatus) -> ValidationError {
        ValidationError::InvalidTransition {
            flow: self.id.to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

/// Dependency-aware, priority-ordered admission control for flows.
///
/// The scheduler is a plain state machine: it decides which flows may start
/// and is told when they finish. Running the flows is the caller's job.
pub struct FlowScheduler {
    config: SchedulerConfig,
    flows: HashMap<FlowId, SchedulableFlow>,
    order: Vec<FlowId>,
    ready_queue: VecDeque<FlowId>,
    running: HashSet<FlowId>,
    finished: Vec<(FlowId, FlowOutcome)>,
    resources: ResourcePool,
    predictor: DurationPredictor,
    event_bus: Option<Arc<EventBus>>,
    ready_seq: u64,
    total_dispatched: u64,
    backpressure_events: u64,
    priority_boosts: u64,
    total_wait_ms: f64,
    stall_reported: bool,
}

impl FlowScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            resources: ResourcePool::new(config.limits),
            predictor: DurationPredictor::new(
                config.history_window,
                config.default_estimate_ms,
                config.per_dependency_estimate_ms,
            ),
            config,
            flows: HashMap::new(),
            order: Vec::new(),
            ready_queue: VecDeque::new(),
            running: HashSet::new(),
            finished: Vec::new(),
            event_bus: None,
            ready_seq: 0,
            total_dispatched: 0,
            backpressure_events: 0,
            priority_boosts: 0,
            total_wait_ms: 0.0,
            stall_reported: false,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.config.max_concurrent = max_concurrent.max(1);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a flow. Dependencies must already be registered; the flow becomes
    /// ready straight away when they have all completed.
    pub fn register_flow(
        &mut self,
        id: FlowId,
        registration: FlowRegistration,
    ) -> Result<(), ValidationError> {
        if self.flows.contains_key(&id) {
            return Err(ValidationError::DuplicateFlow(id.to_string()));
        }
        let resources = registration.resources;
        if !resources.is_valid() || !resources.fits_within(&self.config.limits) {
            return Err(ValidationError::Invalid(format!(
                "resource estimate for {} exceeds scheduler limits: {:?}",
                id, resources
            )));
        }
        for dependency in &registration.dependencies {
            if dependency == &id {
                return Err(ValidationError::CyclicDependency {
                    dependency: dependency.to_string(),
                    dependent: id.to_string(),
                });
            }
            if !self.flows.contains_key(dependency) {
                return Err(ValidationError::FlowNotFound(dependency.to_string()));
            }
        }

        for dependency in &registration.dependencies {
            if let Some(flow) = self.flows.get_mut(dependency) {
                flow.dependents.insert(id.clone());
            }
        }

        let flow = SchedulableFlow {
            flow_type: registration
                .flow_type
                .unwrap_or_else(|| id.to_string()),
            base_priority: registration.priority,
            priority: registration.priority,
            status: FlowStatus::Pending,
            dependencies: registration.dependencies.into_iter().collect(),
            dependents: BTreeSet::new(),
            resources,
            attempts: 0,
            ready_at: None,
            started_at: None,
            finished_at: None,
            cancel_reason: None,
            ready_seq: 0,
            id: id.clone(),
        };
        tracing::debug!(
            "Scheduler registered flow {} (priority {}, {} dependencies)",
            id,
            flow.priority,
            flow.dependencies.len()
        );
        self.flows.insert(id.clone(), flow);
        self.order.push(id);
        self.stall_reported = false;

        self.update_ready_flows();
        Ok(())
    }

    /// Make `dependent` wait for `dependency`.
    ///
    /// Rejected without any mutation when either flow is unknown, when the
    /// dependent has already started, or when the edge would close a cycle.
    pub fn add_dependency(
        &mut self,
        dependent: &FlowId,
        dependency: &FlowId,
    ) -> Result<(), ValidationError> {
        let dependent_flow = self
            .flows
            .get(dependent)
            .ok_or_else(|| ValidationError::FlowNotFound(dependent.to_string()))?;
        if !self.flows.contains_key(dependency) {
            return Err(ValidationError::FlowNotFound(dependency.to_string()));
        }
        if dependent_flow.dependencies.contains(dependency) {
            return Ok(());
        }
        if !matches!(
            dependent_flow.status,
            FlowStatus::Pending | FlowStatus::Ready
        ) {
            return Err(dependent_flow.transition_error(FlowStatus::Pending));
        }
        if self.would_create_cycle(dependent, dependency) {
            tracing::warn!(
                "Rejected dependency {} -> {}: cycle",
                dependency,
                dependent
            );
            return Err(ValidationError::CyclicDependency {
                dependency: dependency.to_string(),
                dependent: dependent.to_string(),
            });
        }

        if let Some(flow) = self.flows.get_mut(dependency) {
            flow.dependents.insert(dependent.clone());
        }
        if let Some(flow) = self.flows.get_mut(dependent) {
            flow.dependencies.insert(dependency.clone());
            if flow.status == FlowStatus::Ready {
                flow.status = FlowStatus::Pending;
                flow.ready_at = None;
                flow.priority = flow.base_priority;
                self.ready_queue.retain(|queued| queued != dependent);
            }
        }

        self.update_ready_flows();
        Ok(())
    }

    /// An edge dependency -> dependent closes a cycle exactly when the
    /// dependent already reaches the dependency through the blocking index.
    fn would_create_cycle(&self, dependent: &FlowId, dependency: &FlowId) -> bool {
        if dependent == dependency {
            return true;
        }
        let mut stack = vec![dependent];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == dependency {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(flow) = self.flows.get(current) {
                stack.extend(flow.dependents.iter());
            }
        }
        false
    }

    fn dependencies_met(&self, flow: &SchedulableFlow) -> bool {
        flow.dependencies.iter().all(|dependency| {
            self.flows
                .get(dependency)
                .is_some_and(|d| d.status == FlowStatus::Completed)
        })
    }

    /// Move every pending flow whose dependencies have all completed onto
    /// the ready queue. Returns how many moved.
    pub fn update_ready_flows(&mut self) -> usize {
        let now = Instant::now();
        let newly_ready: Vec<FlowId> = self
            .order
            .iter()
            .filter(|id| {
                self.flows.get(*id).is_some_and(|flow| {
                    flow.status == FlowStatus::Pending && self.dependencies_met(flow)
                })
            })
            .cloned()
            .collect();

        for id in &newly_ready {
            if let Some(flow) = self.flows.get_mut(id) {
                self.ready_seq += 1;
                flow.status = FlowStatus::Ready;
                flow.ready_at = Some(now);
                flow.ready_seq = self.ready_seq;
                self.ready_queue.push_back(id.clone());
                tracing::debug!("Flow {} is ready", id);
            }
        }
        newly_ready.len()
    }

    /// Boost flows that have waited longer than the max queue time.
    fn apply_aging(&mut self, now: Instant) {
        let max_wait = self.config.max_queue_time().as_millis();
        if max_wait == 0 {
            return;
        }
        for id in &self.ready_queue {
            let Some(flow) = self.flows.get_mut(id) else {
                continue;
            };
            let Some(ready_at) = flow.ready_at else {
                continue;
            };
            let waited = now.saturating_duration_since(ready_at).as_millis();
            let periods = i32::try_from(waited / max_wait).unwrap_or(i32::MAX);
            if periods == 0 {
                continue;
            }
            let boosted = flow
                .base_priority
                .saturating_add(periods.saturating_mul(self.config.priority_boost))
                .min(self.config.max_priority);
            if boosted > flow.priority {
                tracing::debug!(
                    "Aging flow {}: priority {} -> {}",
                    id,
                    flow.priority,
                    boosted
                );
                flow.priority = boosted;
                self.priority_boosts += 1;
            }
        }
    }

    pub fn predict_execution_time(&self, id: &FlowId) -> Option<f64> {
        self.flows
            .get(id)
            .map(|flow| self.predictor.predict(&flow.flow_type, flow.dependencies.len()))
    }

    /// Order the ready queue: priority (high first), predicted duration
    /// (short first, when predictive scheduling is on), resource efficiency,
    /// then queue-entry order.
    pub fn sort_ready_queue(&mut self) {
        struct SortKey {
            id: FlowId,
            priority: i32,
            predicted: f64,
            efficiency: f64,
            ready_at: Option<Instant>,
            seq: u64,
        }

        let mut keys: Vec<SortKey> = self
            .ready_queue
            .iter()
            .filter_map(|id| self.flows.get(id))
            .map(|flow| SortKey {
                id: flow.id.clone(),
                priority: flow.priority,
                predicted: if self.config.predictive {
                    self.predictor
                        .predict(&flow.flow_type, flow.dependencies.len())
                } else {
                    0.0
                },
                efficiency: self.resources.efficiency(&flow.resources),
                ready_at: flow.ready_at,
                seq: flow.ready_seq,
            })
            .collect();

        keys.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.predicted.total_cmp(&b.predicted))
                .then_with(|| b.efficiency.total_cmp(&a.efficiency))
                .then_with(|| a.ready_at.cmp(&b.ready_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        self.ready_queue = keys.into_iter().map(|k| k.id).collect();
    }

    /// Queue a dispatched flow's outcome; resources are reclaimed on the
    /// next tick.
    pub fn report_finished(
        &mut self,
        id: &FlowId,
        outcome: FlowOutcome,
    ) -> Result<(), ValidationError> {
        let flow = self
            .flows
            .get(id)
            .ok_or_else(|| ValidationError::FlowNotFound(id.to_string()))?;
        if flow.status != FlowStatus::Running || self.finished.iter().any(|(f, _)| f == id) {
            let to = match outcome {
                FlowOutcome::Completed => FlowStatus::Completed,
                FlowOutcome::Failed => FlowStatus::Failed,
                FlowOutcome::Skipped => FlowStatus::Cancelled,
            };
            return Err(flow.transition_error(to));
        }
        self.finished.push((id.clone(), outcome));
        Ok(())
    }

    fn process_finished(&mut self, now: Instant) -> usize {
        let finished = std::mem::take(&mut self.finished);
        let count = finished.len();

        for (id, outcome) in finished {
            let Some(flow) = self.flows.get_mut(&id) else {
                continue;
            };
            self.running.remove(&id);
            self.resources.release(&flow.resources);
            flow.finished_at = Some(now);

            match outcome {
                FlowOutcome::Completed => {
                    flow.status = FlowStatus::Completed;
                    if let Some(started) = flow.started_at {
                        let ms = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                        self.predictor.record(&flow.flow_type, ms);
                    }
                }
                FlowOutcome::Failed => {
                    flow.status = FlowStatus::Failed;
                }
                FlowOutcome::Skipped => {
                    flow.status = FlowStatus::Cancelled;
                    flow.cancel_reason = Some("condition not met".to_string());
                }
            }
            tracing::debug!("Flow {} finished as {}", id, flow.status);
        }
        count
    }

    fn under_backpressure(&self) -> bool {
        let utilization = self.resources.utilization();
        let threshold = self.config.backpressure_threshold;
        utilization.cpu > threshold || utilization.memory > threshold
    }

    /// One scheduling tick.
    ///
    /// Reclaims finished flows, refreshes and sorts the ready queue, then
    /// dispatches from its front while concurrency and resources allow.
    /// Returns the flows that are now running and must be started.
    pub fn schedule_flows(&mut self) -> Vec<FlowId> {
        let now = Instant::now();
        let finished = self.process_finished(now);
        self.update_ready_flows();
        self.apply_aging(now);
        self.sort_ready_queue();

        let mut dispatched = Vec::new();
        let mut skipped = Vec::new();
        while self.running.len() < self.config.max_concurrent {
            if self.ready_queue.is_empty() {
                break;
            }
            if self.under_backpressure() {
                self.backpressure_events += 1;
                tracing::debug!(
                    "Backpressure: holding {} ready flows",
                    self.ready_queue.len()
                );
                break;
            }
            let Some(id) = self.ready_queue.pop_front() else {
                break;
            };
            let Some(flow) = self.flows.get_mut(&id) else {
                continue;
            };

            if self.resources.allocate(&flow.resources) {
                flow.status = FlowStatus::Running;
                flow.started_at = Some(now);
                flow.attempts += 1;
                if let Some(ready_at) = flow.ready_at {
                    self.total_wait_ms +=
                        now.saturating_duration_since(ready_at).as_secs_f64() * 1000.0;
                }
                self.total_dispatched += 1;
                self.running.insert(id.clone());
                tracing::info!("Dispatching flow {} (priority {})", id, flow.priority);
                dispatched.push(id);
                continue;
            }

            tracing::debug!("Flow {} waits for resources", id);
            match self.config.queue_policy {
                QueuePolicy::HeadOfLine => {
                    self.ready_queue.push_front(id);
                    break;
                }
                QueuePolicy::SkipBlocked => skipped.push(id),
            }
        }
        for id in skipped.into_iter().rev() {
            self.ready_queue.push_front(id);
        }

        if !dispatched.is_empty() || finished > 0 {
            self.stall_reported = false;
            self.emit(ExecutionEvent::SchedulerStats {
                stats: self.stats(),
                timestamp: Utc::now(),
            });
        }
        if self.is_stalled() && !self.stall_reported {
            self.stall_reported = true;
            let blocked = self.blocked_flows();
            tracing::warn!(
                "Scheduler stalled: {} flows blocked with nothing ready or running",
                blocked.len()
            );
            self.emit(ExecutionEvent::SchedulerStalled {
                blocked,
                timestamp: Utc::now(),
            });
        }

        dispatched
    }

    /// Cancel a flow that has not started.
    pub fn cancel_flow(
        &mut self,
        id: &FlowId,
        reason: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let flow = self
            .flows
            .get_mut(id)
            .ok_or_else(|| ValidationError::FlowNotFound(id.to_string()))?;
        if !matches!(flow.status, FlowStatus::Pending | FlowStatus::Ready) {
            return Err(flow.transition_error(FlowStatus::Cancelled));
        }

        flow.status = FlowStatus::Cancelled;
        flow.cancel_reason = Some(reason.into());
        flow.finished_at = Some(Instant::now());
        self.ready_queue.retain(|queued| queued != id);
        tracing::info!("Cancelled flow {}", id);
        Ok(())
    }

    /// Nothing running, nothing ready, nothing left to reclaim, yet flows
    /// are still pending: they can never become ready.
    pub fn is_stalled(&self) -> bool {
        self.running.is_empty()
            && self.ready_queue.is_empty()
            && self.finished.is_empty()
            && self
                .flows
                .values()
                .any(|flow| flow.status == FlowStatus::Pending)
    }

    /// Pending flows, in registration order.
    pub fn blocked_flows(&self) -> Vec<FlowId> {
        self.order
            .iter()
            .filter(|id| {
                self.flows
                    .get(*id)
                    .is_some_and(|f| f.status == FlowStatus::Pending)
            })
            .cloned()
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.finished.is_empty() && self.flows.values().all(|f| f.status.is_terminal())
    }

    pub fn flow(&self, id: &FlowId) -> Option<&SchedulableFlow> {
        self.flows.get(id)
    }

    pub fn status(&self, id: &FlowId) -> Option<FlowStatus> {
        self.flows.get(id).map(|f| f.status)
    }

    /// Registered flow ids in registration order.
    pub fn flow_ids(&self) -> &[FlowId] {
        &self.order
    }

    /// Edges as (dependency, dependent) pairs, grouped by dependent in
    /// registration order.
    pub fn edges(&self) -> Vec<(FlowId, FlowId)> {
        self.order
            .iter()
            .filter_map(|id| self.flows.get(id))
            .flat_map(|flow| {
                flow.dependencies
                    .iter()
                    .map(move |dependency| (dependency.clone(), flow.id.clone()))
            })
            .collect()
    }

    pub fn ready_queue(&self) -> Vec<FlowId> {
        self.ready_queue.iter().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            queue_depth: self.ready_queue.len(),
            total_dispatched: self.total_dispatched,
            backpressure_events: self.backpressure_events,
            priority_boosts: self.priority_boosts,
            avg_queue_wait_ms: if self.total_dispatched == 0 {
                0.0
            } else {
                self.total_wait_ms / self.total_dispatched as f64
            },
            utilization: self.resources.utilization(),
            stalled: self.is_stalled(),
            ..SchedulerStats::default()
        };
        for flow in self.flows.values() {
            match flow.status {
                FlowStatus::Pending => stats.pending += 1,
                FlowStatus::Ready => stats.ready += 1,
                FlowStatus::Running => stats.running += 1,
                FlowStatus::Completed => stats.completed += 1,
                FlowStatus::Failed => stats.failed += 1,
                FlowStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Re-arm every flow for a fresh execution, keeping registrations and
    /// duration history.
    pub fn reset_run(&mut self) {
        for flow in self.flows.values_mut() {
            flow.status = FlowStatus::Pending;
            flow.priority = flow.base_priority;
            flow.ready_at = None;
            flow.started_at = None;
            flow.finished_at = None;
            flow.cancel_reason = None;
        }
        self.ready_queue.clear();
        self.running.clear();
        self.finished.clear();
        self.resources.reset();
        self.stall_reported = false;
        self.update_ready_flows();
    }

    /// Drop every flow and all history.
    pub fn reset(&mut self) {
        self.flows.clear();
        self.order.clear();
        self.ready_queue.clear();
        self.running.clear();
        self.finished.clear();
        self.resources.reset();
        self.predictor.clear();
        self.ready_seq = 0;
        self.total_dispatched = 0;
        self.backpressure_events = 0;
        self.priority_boosts = 0;
        self.total_wait_ms = 0.0;
        self.stall_reported = false;
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}
