use crate::events::{EventEmitter, ExecutionId};
use crate::{FlowState, StepError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Work performed by a step.
///
/// Any `Fn(StepContext) -> impl Future<Output = Result<StepOutput, StepError>>`
/// closure implements this trait.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, ctx: StepContext) -> Result<StepOutput, StepError>;
}

#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
{
    async fn call(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        (self)(ctx).await
    }
}

/// Execution context passed to each step invocation
#[derive(Clone)]
pub struct StepContext {
    pub flow_name: String,
    pub execution_id: ExecutionId,
    pub step: String,

    /// Result of the step that triggered this one (`Null` for start steps
    /// without inputs)
    pub input: Value,

    /// State shared by every step of the run
    pub state: Arc<RwLock<FlowState>>,

    pub events: EventEmitter,
}

impl StepContext {
    /// Read a state field, failing when it is absent.
    pub async fn require_state(&self, key: &str) -> Result<Value, StepError> {
        self.state
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StepError::MissingInput(key.to_string()))
    }

    pub async fn set_state(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.write().await.set(key, value);
    }

    /// Input field lookup for object inputs.
    pub fn require_input(&self, key: &str) -> Result<&Value, StepError> {
        self.input
            .get(key)
            .ok_or_else(|| StepError::MissingInput(key.to_string()))
    }
}

/// Result of a step invocation.
///
/// `stop` is the completion sentinel: the first step returning it ends the
/// flow with a snapshot of the current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepOutput {
    pub value: Value,
    pub stop: bool,
}

impl StepOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            stop: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            value: Value::Null,
            stop: true,
        }
    }

    /// Route label for routers; listeners registered on the label fire next.
    pub fn route(label: impl Into<String>) -> Self {
        Self::new(Value::String(label.into()))
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Predicate over the flow state and the result of the step that just
/// completed (`source`, `result`).
pub type StepPredicate = Arc<dyn Fn(&FlowState, &str, &Value) -> bool + Send + Sync>;

/// When a listener fires.
#[derive(Clone)]
pub enum TriggerCondition {
    /// Every successful completion of the named step
    Simple(String),
    /// Once each named step has completed since the last firing
    All(BTreeSet<String>),
    /// Any completion of any named step
    Any(BTreeSet<String>),
    /// Re-evaluated after every completion
    Predicate(StepPredicate),
    /// Failure of the named step; input is the error message
    Failure(String),
}

impl TriggerCondition {
    pub fn on(step: impl Into<String>) -> Self {
        TriggerCondition::Simple(step.into())
    }

    pub fn all<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TriggerCondition::All(steps.into_iter().map(Into::into).collect())
    }

    pub fn any<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TriggerCondition::Any(steps.into_iter().map(Into::into).collect())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&FlowState, &str, &Value) -> bool + Send + Sync + 'static,
    {
        TriggerCondition::Predicate(Arc::new(f))
    }

    pub fn failure(step: impl Into<String>) -> Self {
        TriggerCondition::Failure(step.into())
    }

    /// Step names this condition listens to. Empty for predicates.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            TriggerCondition::Simple(name) | TriggerCondition::Failure(name) => {
                vec![name.as_str()]
            }
            TriggerCondition::All(names) | TriggerCondition::Any(names) => {
                names.iter().map(String::as_str).collect()
            }
            TriggerCondition::Predicate(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCondition::Simple(name) => f.debug_tuple("Simple").field(name).finish(),
            TriggerCondition::All(names) => f.debug_tuple("All").field(names).finish(),
            TriggerCondition::Any(names) => f.debug_tuple("Any").field(names).finish(),
            TriggerCondition::Predicate(_) => f.write_str("Predicate(..)"),
            TriggerCondition::Failure(name) => f.debug_tuple("Failure").field(name).finish(),
        }
    }
}

/// Category flags; a router is always also a listener or a start step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepKind {
    pub start: bool,
    pub listener: bool,
    pub router: bool,
}

/// Step definition in a flow
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub condition: Option<TriggerCondition>,
    pub handler: Arc<dyn StepHandler>,
    pub timeout: Option<Duration>,
    pub memoize: bool,
}

impl StepSpec {
    /// Step that runs when the flow begins.
    pub fn start<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: StepHandler + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind {
                start: true,
                listener: false,
                router: false,
            },
            condition: None,
            handler: Arc::new(handler),
            timeout: None,
            memoize: true,
        }
    }

    /// Step that runs when `condition` is met.
    pub fn listen<H>(name: impl Into<String>, condition: TriggerCondition, handler: H) -> Self
    where
        H: StepHandler + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind {
                start: false,
                listener: true,
                router: false,
            },
            condition: Some(condition),
            handler: Arc::new(handler),
            timeout: None,
            memoize: true,
        }
    }

    pub fn router(mut self) -> Self {
        self.kind.router = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_memo(mut self) -> Self {
        self.memoize = false;
        self
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("condition", &self.condition)
            .field("timeout", &self.timeout)
            .field("memoize", &self.memoize)
            .finish()
    }
}
