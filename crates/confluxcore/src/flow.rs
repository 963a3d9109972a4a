use crate::{StepSpec, ValidationError, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a flow registered with the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for FlowId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a flow inside the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Ready => "ready",
            FlowStatus::Running => "running",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Approximate cost of running a flow, in the same units as the scheduler's
/// configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
    pub network: f64,
}

impl ResourceEstimate {
    pub fn new(cpu: f64, memory: f64, io: f64, network: f64) -> Self {
        Self {
            cpu,
            memory,
            io,
            network,
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub fn fits_within(&self, limits: &ResourceEstimate) -> bool {
        self.cpu <= limits.cpu
            && self.memory <= limits.memory
            && self.io <= limits.io
            && self.network <= limits.network
    }

    pub fn is_valid(&self) -> bool {
        [self.cpu, self.memory, self.io, self.network]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

impl Default for ResourceEstimate {
    fn default() -> Self {
        Self::new(0.1, 0.1, 0.1, 0.1)
    }
}

/// Retry policy for a flow. Recorded with the registration; retries are
/// carried out by the layer that owns the work, not the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Builds a flow's inputs from the results of all of its dependencies.
pub type DataMapping =
    Arc<dyn Fn(&BTreeMap<FlowId, Value>) -> BTreeMap<String, Value> + Send + Sync>;

/// Builds input fields from a single dependency's result.
pub type EdgeMapping = Arc<dyn Fn(&Value) -> BTreeMap<String, Value> + Send + Sync>;

/// Decides from a flow's assembled inputs whether it should run at all.
pub type FlowCondition = Arc<dyn Fn(&BTreeMap<String, Value>) -> bool + Send + Sync>;

/// Decides from a dependency's result whether the dependent should run.
pub type EdgeCondition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A named, immutable set of steps
#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub steps: Vec<StepSpec>,
    pub initial_state: BTreeMap<String, Value>,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            steps: Vec::new(),
            initial_state: BTreeMap::new(),
        }
    }

    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn start_steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.iter().filter(|s| s.kind.start)
    }
}

pub struct FlowBuilder {
    name: String,
    steps: Vec<StepSpec>,
    initial_state: BTreeMap<String, Value>,
}

impl FlowBuilder {
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn initial(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.initial_state.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Flow, ValidationError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
        }

        if !self.steps.iter().any(|s| s.kind.start) {
            return Err(ValidationError::NoStartSteps(self.name));
        }

        Ok(Flow {
            name: self.name,
            steps: self.steps,
            initial_state: self.initial_state,
        })
    }
}

/// Registration options for a flow in a multi-flow plan
#[derive(Clone, Default)]
pub struct FlowOptions {
    pub id: Option<FlowId>,
    pub flow_type: Option<String>,
    pub priority: i32,
    pub dependencies: Vec<FlowId>,
    pub resources: ResourceEstimate,
    pub condition: Option<FlowCondition>,
    pub data_mapping: Option<DataMapping>,
    pub retry: Option<RetryPolicy>,
    pub metadata: BTreeMap<String, Value>,
}

impl FlowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<FlowId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Bucket used for duration history; defaults to the flow id.
    pub fn with_flow_type(mut self, flow_type: impl Into<String>) -> Self {
        self.flow_type = Some(flow_type.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<FlowId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceEstimate) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_data_mapping<F>(mut self, mapping: F) -> Self
    where
        F: Fn(&BTreeMap<FlowId, Value>) -> BTreeMap<String, Value> + Send + Sync + 'static,
    {
        self.data_mapping = Some(Arc::new(mapping));
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOptions")
            .field("id", &self.id)
            .field("flow_type", &self.flow_type)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("resources", &self.resources)
            .field("condition", &self.condition.is_some())
            .field("data_mapping", &self.data_mapping.is_some())
            .field("retry", &self.retry)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Options attached to a single dependency edge
#[derive(Clone, Default)]
pub struct DependencyOptions {
    pub condition: Option<EdgeCondition>,
    pub data_mapping: Option<EdgeMapping>,
}

impl DependencyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_data_mapping<F>(mut self, mapping: F) -> Self
    where
        F: Fn(&Value) -> BTreeMap<String, Value> + Send + Sync + 'static,
    {
        self.data_mapping = Some(Arc::new(mapping));
        self
    }
}

impl fmt::Debug for DependencyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyOptions")
            .field("condition", &self.condition.is_some())
            .field("data_mapping", &self.data_mapping.is_some())
            .finish()
    }
}
