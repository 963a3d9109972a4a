//! Multi-flow orchestration runtime
//!
//! [`FlowEngine`] runs a single flow's step graph. [`FlowScheduler`] decides
//! which flows may start given dependencies, priorities and resource
//! budgets, [`ExecutionTracker`] records what happened, and [`Orchestrator`]
//! ties them together into one execution with a critical-path report.

mod cache;
mod config;
mod critical_path;
mod engine;
mod listeners;
mod orchestrator;
mod predictor;
mod registry;
mod resources;
mod scheduler;
mod tracker;

pub use cache::MemoCache;
pub use config::{
    EngineConfig, OrchestratorConfig, QueuePolicy, RuntimeConfig, SchedulerConfig, TrackerConfig,
};
pub use critical_path::{
    compute_critical_path, validate_plan, CriticalPath, DependencyGraph, NodeTiming,
};
pub use engine::{FlowEngine, FlowRunOutcome, StepFailure, StepObserver};
pub use listeners::ListenerIndex;
pub use orchestrator::{
    ExecutionMetrics, ExecutionReport, ExecutionRequest, ExecutionStrategy, Orchestrator,
};
pub use predictor::DurationPredictor;
pub use registry::{FlowRegistry, RegisteredFlow};
pub use resources::ResourcePool;
pub use scheduler::{FlowOutcome, FlowRegistration, FlowScheduler, SchedulableFlow};
pub use tracker::{
    Bottleneck, ExecutionTracker, FlowExecutionRecord, NodeExecutionRecord, TrackerMetrics,
};
