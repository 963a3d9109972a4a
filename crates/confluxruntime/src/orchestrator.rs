use crate::config::RuntimeConfig;
use crate::critical_path::{compute_critical_path, validate_plan, CriticalPath};
use crate::engine::{FlowEngine, FlowRunOutcome, StepObserver};
use crate::registry::{FlowRegistry, RegisteredFlow};
use crate::scheduler::{FlowOutcome, FlowRegistration, FlowScheduler};
use crate::tracker::{ExecutionTracker, TrackerMetrics};
use async_trait::async_trait;
use chrono::Utc;
use confluxcore::{
    DependencyOptions, EventBus, ExecutionEvent, ExecutionId, Flow, FlowError, FlowId,
    FlowOptions, FlowStatus, SchedulerStats, StatePersistence, StepError, ValidationError, Value,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How dispatched flows share the scheduler's concurrency budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Parallel,
    /// One flow at a time, still in dependency and priority order
    Sequential,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Seed inputs handed to every flow
    pub input_data: BTreeMap<String, Value>,
    pub strategy: ExecutionStrategy,
}

impl ExecutionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(key.into(), value.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    /// Flows that ran to an outcome: completed plus failed
    pub flows_executed: usize,
    pub flows_completed: usize,
    pub flows_failed: usize,
    pub flows_cancelled: usize,
    pub total_duration_ms: u64,
    pub tracker: TrackerMetrics,
    pub scheduler: SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub results: BTreeMap<FlowId, Value>,
    pub errors: BTreeMap<FlowId, String>,
    pub statuses: BTreeMap<FlowId, FlowStatus>,
    pub metrics: ExecutionMetrics,
    pub critical_path: CriticalPath,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn status(&self, id: &FlowId) -> Option<FlowStatus> {
        self.statuses.get(id).copied()
    }
}

/// Feeds step lifecycle callbacks of one flow into the tracker's node records
struct TrackerObserver {
    flow_id: FlowId,
    tracker: Arc<RwLock<ExecutionTracker>>,
}

#[async_trait]
impl StepObserver for TrackerObserver {
    async fn step_started(&self, step: &str) {
        if let Err(e) = self.tracker.write().await.start_node(&self.flow_id, step) {
            tracing::debug!("Untracked step {} on {}: {}", step, self.flow_id, e);
        }
    }

    async fn step_finished(&self, step: &str, _duration: Duration, error: Option<&StepError>) {
        let error = error.map(ToString::to_string);
        if let Err(e) = self
            .tracker
            .write()
            .await
            .complete_node(&self.flow_id, step, error)
        {
            tracing::debug!("Untracked step {} on {}: {}", step, self.flow_id, e);
        }
    }
}

type FlowTaskResult = (Result<FlowRunOutcome, FlowError>, Duration);

/// Runs many flows as one dependency-ordered, resource-aware execution.
///
/// Flows are registered with their options, wired together with
/// dependencies, then driven by [`Orchestrator::execute`]: the scheduler
/// decides what may start, each dispatched flow runs on its own task, and
/// completions feed results to dependents.
pub struct Orchestrator {
    config: RuntimeConfig,
    registry: RwLock<FlowRegistry>,
    scheduler: Arc<Mutex<FlowScheduler>>,
    tracker: Arc<RwLock<ExecutionTracker>>,
    results: Arc<RwLock<HashMap<FlowId, Value>>>,
    event_bus: Arc<EventBus>,
    persistence: Option<Arc<dyn StatePersistence>>,
    cancel: std::sync::Mutex<CancellationToken>,
    execution_lock: Mutex<()>,
    last_duration_ms: AtomicU64,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let scheduler =
            FlowScheduler::new(config.scheduler.clone()).with_event_bus(event_bus.clone());

        Self {
            registry: RwLock::new(FlowRegistry::new()),
            scheduler: Arc::new(Mutex::new(scheduler)),
            tracker: Arc::new(RwLock::new(ExecutionTracker::new(config.tracker.clone()))),
            results: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
            persistence: None,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            execution_lock: Mutex::new(()),
            last_duration_ms: AtomicU64::new(0),
            config,
        }
    }

    /// Persist flow state through the given store.
    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a flow. Dependencies named in the options must already be
    /// registered. Returns the flow's id, generated when none was given.
    ///
    /// Waits for a running execution to finish.
    pub async fn register_flow(
        &self,
        flow: Flow,
        options: FlowOptions,
    ) -> Result<FlowId, FlowError> {
        if flow.start_steps().next().is_none() {
            return Err(ValidationError::NoStartSteps(flow.name.clone()).into());
        }

        let _idle = self.execution_lock.lock().await;

        let id = options.id.clone().unwrap_or_else(FlowId::generate);
        let mut registry = self.registry.write().await;
        if registry.contains(&id) {
            return Err(ValidationError::DuplicateFlow(id.to_string()).into());
        }

        self.scheduler.lock().await.register_flow(
            id.clone(),
            FlowRegistration {
                flow_type: options.flow_type.clone(),
                priority: options.priority,
                dependencies: options.dependencies.clone(),
                resources: options.resources,
            },
        )?;

        {
            let mut tracker = self.tracker.write().await;
            tracker.register_flow(id.clone(), options.metadata.clone());
            for dependency in &options.dependencies {
                tracker.add_dependency(dependency, &id)?;
            }
        }

        let priority = options.priority;
        let dependencies = options.dependencies.clone();
        registry.register(id.clone(), flow, options)?;

        self.event_bus.emit(ExecutionEvent::FlowRegistered {
            flow_id: id.clone(),
            priority,
            dependencies,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Make `dependent` wait for `dependency`, optionally with an edge
    /// condition and data mapping. Rejected without changes if it would
    /// close a cycle.
    pub async fn add_dependency(
        &self,
        dependency: impl Into<FlowId>,
        dependent: impl Into<FlowId>,
        options: DependencyOptions,
    ) -> Result<(), FlowError> {
        let dependency = dependency.into();
        let dependent = dependent.into();
        let _idle = self.execution_lock.lock().await;
        let mut registry = self.registry.write().await;
        for id in [&dependency, &dependent] {
            if !registry.contains(id) {
                return Err(ValidationError::FlowNotFound(id.to_string()).into());
            }
        }

        self.scheduler
            .lock()
            .await
            .add_dependency(&dependent, &dependency)?;
        registry.set_edge(&dependency, &dependent, options)?;
        self.tracker
            .write()
            .await
            .add_dependency(&dependency, &dependent)?;

        tracing::info!("Added dependency {} -> {}", dependency, dependent);
        Ok(())
    }

    /// Run every registered flow to a terminal state.
    ///
    /// Fails only when the plan itself is invalid. Flow failures, timeouts,
    /// skips and cancellations are reported in the returned report.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, FlowError> {
        let _running = self.execution_lock.lock().await;

        let (ids, flows) = {
            let registry = self.registry.read().await;
            let flows: HashMap<FlowId, RegisteredFlow> = registry
                .ids()
                .iter()
                .filter_map(|id| registry.get(id).map(|f| (id.clone(), f.clone())))
                .collect();
            (registry.ids().to_vec(), flows)
        };
        let edges = self.scheduler.lock().await.edges();
        validate_plan(&ids, &edges)?;

        let execution_id = ExecutionId::new_v4();
        let started = Instant::now();
        tracing::info!(
            "Starting execution {} of {} flows ({:?})",
            execution_id,
            ids.len(),
            request.strategy
        );

        self.prepare_run(&ids, &flows, request.strategy).await?;

        let token = self.arm_cancellation();
        let deadline = self
            .config
            .orchestrator
            .execution_timeout()
            .map(|limit| started + limit);
        let mut ticker = interval(self.config.scheduler.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut running = FuturesUnordered::new();
        let mut errors: BTreeMap<FlowId, String> = BTreeMap::new();
        let mut skipped: HashSet<FlowId> = HashSet::new();
        let mut stopping = false;

        loop {
            let dispatched = {
                let mut scheduler = self.scheduler.lock().await;
                let dispatched = scheduler.schedule_flows();
                let ready = scheduler.ready_queue();
                drop(scheduler);
                self.mirror_ready(&ready).await;
                dispatched
            };

            let mut reschedule = false;
            for id in dispatched {
                let Some(entry) = flows.get(&id) else {
                    self.scheduler
                        .lock()
                        .await
                        .report_finished(&id, FlowOutcome::Failed)?;
                    reschedule = true;
                    continue;
                };
                match self
                    .launch(entry, &request.input_data, execution_id)
                    .await?
                {
                    Some(handle) => running.push(async move { (id, handle.await) }),
                    None => {
                        skipped.insert(id);
                        reschedule = true;
                    }
                }
            }
            if reschedule {
                continue;
            }

            if running.is_empty() {
                let scheduler = self.scheduler.lock().await;
                if scheduler.all_terminal() {
                    break;
                }
                if scheduler.is_stalled() {
                    drop(scheduler);
                    self.cancel_stalled().await?;
                    continue;
                }
            }

            tokio::select! {
                Some((id, joined)) = running.next(), if !running.is_empty() => {
                    self.finish_flow(id, joined, execution_id, &mut errors).await?;
                }
                _ = ticker.tick() => {}
                _ = token.cancelled(), if !stopping => {
                    stopping = true;
                    self.cancel_remaining("execution cancelled").await?;
                }
                _ = wait_for(deadline), if !stopping => {
                    stopping = true;
                    tracing::warn!("Execution {} timed out", execution_id);
                    self.cancel_remaining("execution timed out").await?;
                }
            }
        }

        let total_duration_ms = started.elapsed().as_millis() as u64;
        self.last_duration_ms
            .store(total_duration_ms, Ordering::Relaxed);

        let report = self
            .build_report(execution_id, &ids, &edges, errors, &skipped)
            .await?;
        tracing::info!(
            "Execution {} finished in {}ms: {} completed, {} failed, {} cancelled",
            execution_id,
            total_duration_ms,
            report.metrics.flows_completed,
            report.metrics.flows_failed,
            report.metrics.flows_cancelled
        );
        Ok(report)
    }

    /// Re-arm scheduler, tracker and result cache for a fresh execution.
    async fn prepare_run(
        &self,
        ids: &[FlowId],
        flows: &HashMap<FlowId, RegisteredFlow>,
        strategy: ExecutionStrategy,
    ) -> Result<(), FlowError> {
        {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.reset_run();
            scheduler.set_max_concurrent(match strategy {
                ExecutionStrategy::Parallel => self.config.scheduler.max_concurrent,
                ExecutionStrategy::Sequential => 1,
            });
        }
        self.results.write().await.clear();

        let mut tracker = self.tracker.write().await;
        tracker.reset();
        for id in ids {
            let metadata = flows
                .get(id)
                .map(|f| f.options.metadata.clone())
                .unwrap_or_default();
            tracker.register_flow(id.clone(), metadata);
        }
        for entry in flows.values() {
            for dependency in entry.edges.keys() {
                tracker.add_dependency(dependency, &entry.id)?;
            }
        }
        Ok(())
    }

    async fn mirror_ready(&self, ready: &[FlowId]) {
        if ready.is_empty() {
            return;
        }
        let mut tracker = self.tracker.write().await;
        for id in ready {
            let pending = tracker
                .record(id)
                .is_some_and(|r| r.status == FlowStatus::Pending);
            if pending {
                if let Err(e) = tracker.update_status(id, FlowStatus::Ready) {
                    tracing::debug!("Untracked ready flow {}: {}", id, e);
                }
            }
        }
    }

    /// Start a dispatched flow, or report it skipped when a condition is
    /// false. Returns the task handle of a started flow.
    async fn launch(
        &self,
        entry: &RegisteredFlow,
        input_data: &BTreeMap<String, Value>,
        execution_id: ExecutionId,
    ) -> Result<Option<JoinHandle<FlowTaskResult>>, FlowError> {
        let id = entry.id.clone();
        let dependency_results: BTreeMap<FlowId, Value> = {
            let results = self.results.read().await;
            entry
                .edges
                .keys()
                .filter_map(|dep| results.get(dep).map(|v| (dep.clone(), v.clone())))
                .collect()
        };
        let inputs = entry.assemble_inputs(input_data, &dependency_results);

        if let Err(reason) = entry.check_conditions(&inputs, &dependency_results) {
            tracing::info!("Skipping flow {}: {}", id, reason);
            self.scheduler
                .lock()
                .await
                .report_finished(&id, FlowOutcome::Skipped)?;
            self.tracker
                .write()
                .await
                .cancel_flow_execution(&id, reason)?;
            return Ok(None);
        }

        self.tracker.write().await.start_flow_execution(&id)?;
        let attempt = self
            .scheduler
            .lock()
            .await
            .flow(&id)
            .map_or(1, |f| f.attempts);
        self.event_bus.emit(ExecutionEvent::FlowStarted {
            flow_id: id.clone(),
            execution_id,
            attempt,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting flow {} (attempt {})", id, attempt);

        let flow = entry.flow.clone();
        let engine_config = self.config.engine.clone();
        let event_bus = self.event_bus.clone();
        let persistence = self.persistence.clone();
        let observer = Arc::new(TrackerObserver {
            flow_id: id.clone(),
            tracker: self.tracker.clone(),
        });
        let flow_timeout = self.config.orchestrator.flow_timeout();

        let task = async move {
            let started = Instant::now();
            let result = match FlowEngine::new(&flow, engine_config, event_bus) {
                Err(e) => Err(FlowError::from(e)),
                Ok(engine) => {
                    let mut engine = engine.with_observer(observer);
                    if let Some(persistence) = persistence {
                        engine = engine.with_persistence(persistence);
                    }
                    let run = engine.run(inputs);
                    match flow_timeout {
                        Some(limit) => timeout(limit, run).await.unwrap_or_else(|_| {
                            Err(FlowError::Timeout {
                                millis: limit.as_millis() as u64,
                            })
                        }),
                        None => run.await,
                    }
                }
            };
            (result, started.elapsed())
        };
        Ok(Some(tokio::spawn(task)))
    }

    async fn finish_flow(
        &self,
        id: FlowId,
        joined: Result<FlowTaskResult, JoinError>,
        execution_id: ExecutionId,
        errors: &mut BTreeMap<FlowId, String>,
    ) -> Result<(), FlowError> {
        let (result, duration) = match joined {
            Ok(finished) => finished,
            Err(e) => (
                Err(FlowError::Execution(format!("Task join error: {}", e))),
                Duration::ZERO,
            ),
        };
        let duration_ms = duration.as_millis() as u64;

        let failure = match result {
            Ok(outcome) if outcome.succeeded() => {
                tracing::info!("Flow {} completed in {}ms", id, duration_ms);
                self.results
                    .write()
                    .await
                    .insert(id.clone(), outcome.value.clone());
                self.tracker
                    .write()
                    .await
                    .complete_flow_execution(&id, true, Some(outcome.value))?;
                self.scheduler
                    .lock()
                    .await
                    .report_finished(&id, FlowOutcome::Completed)?;
                self.event_bus.emit(ExecutionEvent::FlowCompleted {
                    flow_id: id,
                    execution_id,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                return Ok(());
            }
            Ok(outcome) => outcome
                .unhandled_failures()
                .map(|f| format!("{}: {}", f.step, f.error))
                .collect::<Vec<_>>()
                .join("; "),
            Err(e) => e.to_string(),
        };

        tracing::error!("Flow {} failed: {}", id, failure);
        {
            let mut tracker = self.tracker.write().await;
            tracker.record_error(&id, failure.clone())?;
            tracker.complete_flow_execution(&id, false, None)?;
        }
        self.scheduler
            .lock()
            .await
            .report_finished(&id, FlowOutcome::Failed)?;
        self.event_bus.emit(ExecutionEvent::FlowError {
            flow_id: id.clone(),
            error: failure.clone(),
            timestamp: Utc::now(),
        });
        errors.insert(id, failure);
        Ok(())
    }

    /// Cancel every flow that has not started; running flows drain.
    async fn cancel_remaining(&self, reason: &str) -> Result<(), FlowError> {
        let mut scheduler = self.scheduler.lock().await;
        let mut tracker = self.tracker.write().await;
        let waiting: Vec<FlowId> = scheduler
            .flow_ids()
            .iter()
            .filter(|id| {
                matches!(
                    scheduler.status(id),
                    Some(FlowStatus::Pending | FlowStatus::Ready)
                )
            })
            .cloned()
            .collect();

        tracing::warn!("Cancelling {} waiting flows: {}", waiting.len(), reason);
        for id in waiting {
            scheduler.cancel_flow(&id, reason)?;
            tracker.cancel_flow_execution(&id, reason)?;
        }
        Ok(())
    }

    /// Cancel pending flows that can never become ready, naming the
    /// dependencies they were waiting on.
    async fn cancel_stalled(&self) -> Result<(), FlowError> {
        let mut scheduler = self.scheduler.lock().await;
        let mut tracker = self.tracker.write().await;

        for id in scheduler.blocked_flows() {
            let blockers: Vec<String> = scheduler
                .flow(&id)
                .map(|flow| {
                    flow.dependencies
                        .iter()
                        .filter(|d| scheduler.status(d) != Some(FlowStatus::Completed))
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let reason = format!("blocked by unfinished dependencies: {}", blockers.join(", "));
            tracing::warn!("Flow {} {}", id, reason);
            scheduler.cancel_flow(&id, reason.clone())?;
            tracker.cancel_flow_execution(&id, reason)?;
        }
        Ok(())
    }

    async fn build_report(
        &self,
        execution_id: ExecutionId,
        ids: &[FlowId],
        edges: &[(FlowId, FlowId)],
        mut errors: BTreeMap<FlowId, String>,
        skipped: &HashSet<FlowId>,
    ) -> Result<ExecutionReport, FlowError> {
        let mut statuses = BTreeMap::new();
        {
            let scheduler = self.scheduler.lock().await;
            for id in ids {
                let Some(flow) = scheduler.flow(id) else {
                    continue;
                };
                statuses.insert(id.clone(), flow.status);
                if flow.status == FlowStatus::Cancelled && !skipped.contains(id) {
                    errors.entry(id.clone()).or_insert_with(|| {
                        flow.cancel_reason
                            .clone()
                            .unwrap_or_else(|| "cancelled".to_string())
                    });
                }
            }
        }

        let results: BTreeMap<FlowId, Value> = self
            .results
            .read()
            .await
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();

        // Only flows that actually ran take part in the critical path
        let durations = self.tracker.read().await.durations();
        let timed: Vec<FlowId> = ids
            .iter()
            .filter(|id| durations.contains_key(*id))
            .cloned()
            .collect();
        let timed_edges: Vec<(FlowId, FlowId)> = edges
            .iter()
            .filter(|(from, to)| durations.contains_key(from) && durations.contains_key(to))
            .cloned()
            .collect();
        let critical_path = compute_critical_path(&timed, &timed_edges, &durations)?;

        Ok(ExecutionReport {
            execution_id,
            results,
            errors,
            statuses,
            metrics: self.metrics().await,
            critical_path,
        })
    }

    /// Live snapshot of tracker and scheduler statistics.
    pub async fn metrics(&self) -> ExecutionMetrics {
        let tracker = self.tracker.read().await.get_metrics();
        let scheduler = self.scheduler.lock().await.stats();

        ExecutionMetrics {
            flows_executed: scheduler.completed + scheduler.failed,
            flows_completed: scheduler.completed,
            flows_failed: scheduler.failed,
            flows_cancelled: scheduler.cancelled,
            total_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            tracker,
            scheduler,
        }
    }

    /// Cancel a flow that has not started yet.
    pub async fn cancel_flow(&self, id: &FlowId) -> Result<(), FlowError> {
        let reason = "cancelled by caller";
        self.scheduler.lock().await.cancel_flow(id, reason)?;
        self.tracker
            .write()
            .await
            .cancel_flow_execution(id, reason)?;
        Ok(())
    }

    /// Cancel the current execution: waiting flows are cancelled, running
    /// flows finish. The next execution starts with a fresh token.
    pub fn cancel(&self) {
        self.current_token().cancel();
    }

    /// Token of the current (or next) execution.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.current_token()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace a token spent by an earlier execution.
    fn arm_cancellation(&self) -> CancellationToken {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            tracing::debug!("Re-arming cancellation token");
            *token = CancellationToken::new();
        }
        token.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn flow_status(&self, id: &FlowId) -> Option<FlowStatus> {
        self.scheduler.lock().await.status(id)
    }

    /// Result of a flow that completed in the last execution.
    pub async fn result(&self, id: &FlowId) -> Option<Value> {
        self.results.read().await.get(id).cloned()
    }

    pub async fn flow_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub fn scheduler(&self) -> &Arc<Mutex<FlowScheduler>> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<RwLock<ExecutionTracker>> {
        &self.tracker
    }

    /// Forget every registered flow and all recorded history.
    pub async fn reset(&self) {
        let _running = self.execution_lock.lock().await;
        self.registry.write().await.clear();
        self.scheduler.lock().await.reset();
        self.tracker.write().await.reset();
        self.results.write().await.clear();
        self.last_duration_ms.store(0, Ordering::Relaxed);
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
