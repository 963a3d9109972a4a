use crate::cache::MemoCache;
use crate::config::EngineConfig;
use crate::listeners::ListenerIndex;
use async_trait::async_trait;
use chrono::Utc;
use confluxcore::{
    EventBus, ExecutionEvent, ExecutionId, Flow, FlowError, FlowState, StatePersistence,
    StepContext, StepError, StepPredicate, StepSpec, ValidationError, Value,
};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// Receives step lifecycle callbacks from a running engine
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn step_started(&self, step: &str);

    async fn step_finished(&self, step: &str, duration: Duration, error: Option<&StepError>);
}

/// A step that failed during a run
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step: String,
    pub error: StepError,
    /// A failure listener was registered for the step
    pub handled: bool,
}

/// Result of a flow run
#[derive(Debug, Clone)]
pub struct FlowRunOutcome {
    pub execution_id: ExecutionId,
    /// State snapshot when a step stopped the flow, otherwise the result of
    /// the last step to complete
    pub value: Value,
    pub state: FlowState,
    pub stopped: bool,
    pub steps_executed: usize,
    pub failures: Vec<StepFailure>,
}

impl FlowRunOutcome {
    pub fn unhandled_failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.failures.iter().filter(|f| !f.handled)
    }

    pub fn succeeded(&self) -> bool {
        self.unhandled_failures().next().is_none()
    }
}

#[derive(Default)]
struct RunProgress {
    executions: usize,
    last_result: Option<Value>,
    stop_value: Option<Value>,
    failures: Vec<StepFailure>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one flow instance: a graph of steps connected by trigger
/// conditions.
///
/// Start steps run concurrently when the flow begins. Each completion fans out
/// to the listeners it triggers, which run concurrently on the same task; a
/// step's downstream work is finished once all of them are.
pub struct FlowEngine {
    name: String,
    config: EngineConfig,
    steps: HashMap<String, Arc<StepSpec>>,
    start_order: Vec<String>,
    listeners: Mutex<ListenerIndex>,
    cache: Mutex<MemoCache>,
    progress: Mutex<RunProgress>,
    stop_signal: watch::Sender<bool>,
    state: Arc<RwLock<FlowState>>,
    event_bus: Arc<EventBus>,
    persistence: Option<Arc<dyn StatePersistence>>,
    observer: Option<Arc<dyn StepObserver>>,
    execution_id: ExecutionId,
}

impl FlowEngine {
    pub fn new(
        flow: &Flow,
        config: EngineConfig,
        event_bus: Arc<EventBus>,
    ) -> Result<Self, ValidationError> {
        let mut engine = Self {
            name: flow.name.clone(),
            cache: Mutex::new(MemoCache::new(&config)),
            config,
            steps: HashMap::new(),
            start_order: Vec::new(),
            listeners: Mutex::new(ListenerIndex::new()),
            progress: Mutex::new(RunProgress::default()),
            stop_signal: watch::channel(false).0,
            state: Arc::new(RwLock::new(FlowState::with_fields(
                flow.initial_state.clone(),
            ))),
            event_bus,
            persistence: None,
            observer: None,
            execution_id: ExecutionId::new_v4(),
        };

        for step in &flow.steps {
            engine.register(step.clone())?;
        }
        Ok(engine)
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Classify and index a step.
    pub fn register(&mut self, step: StepSpec) -> Result<(), ValidationError> {
        if self.steps.contains_key(&step.name) {
            return Err(ValidationError::DuplicateStep(step.name));
        }

        if step.kind.start {
            self.start_order.push(step.name.clone());
        }
        if let Some(condition) = &step.condition {
            lock(&self.listeners).register(&step.name, condition);
        }

        tracing::debug!(
            "Registered step {} on flow {} ({:?})",
            step.name,
            self.name,
            step.kind
        );
        self.steps.insert(step.name.clone(), Arc::new(step));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn state(&self) -> Arc<RwLock<FlowState>> {
        self.state.clone()
    }

    pub fn cached_results(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Run the flow: merge inputs into state, launch every start step, and
    /// wait until the triggered graph settles or a step stops the flow.
    ///
    /// A stop returns at once; steps still in flight are dropped.
    ///
    /// Step failures never surface as errors here; they are reported in the
    /// outcome.
    pub async fn run(&self, inputs: BTreeMap<String, Value>) -> Result<FlowRunOutcome, FlowError> {
        if self.start_order.is_empty() {
            return Err(ValidationError::NoStartSteps(self.name.clone()).into());
        }

        let started = Instant::now();
        self.restore_state(&inputs).await;
        {
            let mut fields = inputs.clone();
            fields.remove("id");
            self.state.write().await.merge(fields);
        }
        self.persist().await;

        *lock(&self.progress) = RunProgress::default();
        lock(&self.listeners).reset();
        self.stop_signal.send_replace(false);
        let mut stop = self.stop_signal.subscribe();

        let state_id = self.state.read().await.id;
        self.event_bus.emit(ExecutionEvent::RunStarted {
            execution_id: self.execution_id,
            flow_name: self.name.clone(),
            state_id,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting flow {} (state {})", self.name, state_id);

        let input = Value::Object(inputs);
        let starts = self
            .start_order
            .iter()
            .map(|name| self.execute_boxed(name.clone(), input.clone()));
        tokio::select! {
            _ = join_all(starts) => {}
            _ = stop.wait_for(|stopped| *stopped) => {
                tracing::debug!("Flow {} dropping in-flight steps after stop", self.name);
            }
        }

        let progress = std::mem::take(&mut *lock(&self.progress));
        let state = self.state.read().await.clone();
        let stopped = progress.stop_value.is_some();
        let value = progress
            .stop_value
            .or(progress.last_result)
            .unwrap_or(Value::Null);
        let duration_ms = started.elapsed().as_millis() as u64;

        self.event_bus.emit(ExecutionEvent::RunFinished {
            execution_id: self.execution_id,
            flow_name: self.name.clone(),
            stopped,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Flow {} finished in {}ms ({} steps, {} failures)",
            self.name,
            duration_ms,
            progress.executions,
            progress.failures.len()
        );

        Ok(FlowRunOutcome {
            execution_id: self.execution_id,
            value,
            state,
            stopped,
            steps_executed: progress.executions,
            failures: progress.failures,
        })
    }

    /// Execute one step and everything it triggers.
    ///
    /// A fresh memoized result for the same input is returned directly, with
    /// no events and no downstream triggering.
    pub async fn execute_step(&self, name: &str, input: Value) -> Result<Value, StepError> {
        self.execute_boxed(name.to_string(), input).await
    }

    fn execute_boxed(&self, name: String, input: Value) -> BoxFuture<'_, Result<Value, StepError>> {
        async move { self.execute_step_inner(&name, input).await }.boxed()
    }

    async fn execute_step_inner(&self, name: &str, input: Value) -> Result<Value, StepError> {
        let step = self
            .steps
            .get(name)
            .cloned()
            .ok_or_else(|| StepError::UnknownStep(name.to_string()))?;

        let cache_key = if self.config.memoize && step.memoize {
            MemoCache::key(name, &input)
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = lock(&self.cache).get(key, Instant::now()) {
                tracing::debug!("Cache hit for step {} on flow {}", name, self.name);
                return Ok(hit.value);
            }
        }

        let limit_reached = {
            let mut progress = lock(&self.progress);
            if progress.executions >= self.config.max_step_executions {
                true
            } else {
                progress.executions += 1;
                false
            }
        };
        if limit_reached {
            let error = StepError::ExecutionLimit {
                limit: self.config.max_step_executions,
            };
            self.fail_step(name, &error, false);
            return Err(error);
        }

        self.event_bus.emit(ExecutionEvent::StepStarted {
            execution_id: self.execution_id,
            step: name.to_string(),
            timestamp: Utc::now(),
        });
        if let Some(observer) = &self.observer {
            observer.step_started(name).await;
        }

        let ctx = StepContext {
            flow_name: self.name.clone(),
            execution_id: self.execution_id,
            step: name.to_string(),
            input,
            state: self.state.clone(),
            events: self.event_bus.create_emitter(self.execution_id, name),
        };

        let started = Instant::now();
        let result = match step.timeout.or(self.config.step_timeout()) {
            Some(limit) => match timeout(limit, step.handler.call(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout {
                    millis: limit.as_millis() as u64,
                }),
            },
            None => step.handler.call(ctx).await,
        };
        let elapsed = started.elapsed();

        if let Some(observer) = &self.observer {
            observer
                .step_finished(name, elapsed, result.as_ref().err())
                .await;
        }

        match result {
            Ok(output) => {
                tracing::debug!(
                    "Step {} on flow {} completed in {}ms",
                    name,
                    self.name,
                    elapsed.as_millis()
                );
                self.event_bus.emit(ExecutionEvent::StepCompleted {
                    execution_id: self.execution_id,
                    step: name.to_string(),
                    output: output.value.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: Utc::now(),
                });

                if let Some(key) = cache_key {
                    lock(&self.cache).insert(key, output.clone(), Instant::now());
                }
                lock(&self.progress).last_result = Some(output.value.clone());
                self.persist().await;

                if output.stop {
                    self.signal_stop(name).await;
                    return Ok(output.value);
                }
                if self.is_stopped() {
                    return Ok(output.value);
                }

                let triggered = self.triggered_by(name, step.kind.router, &output.value).await;
                if !triggered.is_empty() {
                    tracing::debug!("Step {} triggers {:?}", name, triggered);
                    let fan_out = triggered
                        .into_iter()
                        .map(|listener| self.execute_boxed(listener, output.value.clone()));
                    join_all(fan_out).await;
                }
                Ok(output.value)
            }
            Err(error) => {
                let listeners = lock(&self.listeners).failure_listeners(name);
                self.fail_step(name, &error, !listeners.is_empty());
                self.persist().await;

                if !listeners.is_empty() && !self.is_stopped() {
                    let input = Value::String(error.to_string());
                    let fan_out = listeners
                        .into_iter()
                        .map(|listener| self.execute_boxed(listener, input.clone()));
                    join_all(fan_out).await;
                }
                Err(error)
            }
        }
    }

    /// Listeners fired by a successful completion of `source`, deduplicated
    /// and in registration order.
    async fn triggered_by(&self, source: &str, router: bool, result: &Value) -> Vec<String> {
        let mut triggered = lock(&self.listeners).on_completion(source);

        if router {
            if let Value::String(label) = result {
                if label != source {
                    triggered.extend(lock(&self.listeners).on_completion(label));
                }
            }
        }

        let predicates: Vec<(String, StepPredicate)> =
            lock(&self.listeners).predicate_listeners().to_vec();
        if !predicates.is_empty() {
            let state = self.state.read().await;
            triggered.extend(
                predicates
                    .into_iter()
                    .filter(|(listener, predicate)| {
                        listener != source && predicate(&state, source, result)
                    })
                    .map(|(listener, _)| listener),
            );
        }

        let mut seen = HashSet::new();
        triggered.retain(|listener| seen.insert(listener.clone()));
        triggered
    }

    fn fail_step(&self, name: &str, error: &StepError, handled: bool) {
        tracing::warn!("Step {} on flow {} failed: {}", name, self.name, error);
        self.event_bus.emit(ExecutionEvent::StepFailed {
            execution_id: self.execution_id,
            step: name.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        lock(&self.progress).failures.push(StepFailure {
            step: name.to_string(),
            error: error.clone(),
            handled,
        });
    }

    /// The first stop wins; later ones leave the completion value alone.
    async fn signal_stop(&self, step: &str) {
        let snapshot = self.state.read().await.to_value();
        {
            let mut progress = lock(&self.progress);
            if progress.stop_value.is_some() {
                return;
            }
            tracing::info!("Flow {} stopped by step {}", self.name, step);
            progress.stop_value = Some(snapshot);
        }
        self.stop_signal.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        lock(&self.progress).stop_value.is_some()
    }

    async fn restore_state(&self, inputs: &BTreeMap<String, Value>) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let Some(id) = inputs.get("id").and_then(Value::as_str) else {
            return;
        };
        let Ok(id) = Uuid::parse_str(id) else {
            tracing::warn!("Ignoring non-uuid state id {} for flow {}", id, self.name);
            return;
        };

        match persistence.load_state(id).await {
            Ok(Some(saved)) => {
                tracing::info!("Restored state {} for flow {}", id, self.name);
                *self.state.write().await = saved;
            }
            Ok(None) => {
                tracing::debug!("No saved state {} for flow {}", id, self.name);
                self.state.write().await.id = id;
            }
            Err(e) => tracing::warn!("Failed to load state {} for flow {}: {}", id, self.name, e),
        }
    }

    async fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let state = self.state.read().await.clone();
        if let Err(e) = persistence.save_state(&self.name, &state).await {
            tracing::warn!("Failed to persist state for flow {}: {}", self.name, e);
        }
    }
}
