//! Core vocabulary for the conflux orchestrator
//!
//! Values, flow state, step and flow definitions, trigger conditions,
//! events and errors shared by the engine and the multi-flow runtime.
//! Nothing in this crate schedules or executes work.

mod error;
pub mod events;
mod flow;
mod persistence;
mod state;
mod stats;
mod step;
mod value;

pub use error::{FlowError, StepError, ValidationError};
pub use events::*;
pub use flow::{
    DataMapping, DependencyOptions, EdgeCondition, EdgeMapping, Flow, FlowBuilder,
    FlowCondition, FlowId, FlowOptions, FlowStatus, ResourceEstimate, RetryPolicy,
};
pub use persistence::{InMemoryStatePersistence, StatePersistence};
pub use state::FlowState;
pub use stats::{ResourceUtilization, SchedulerStats};
pub use step::{
    StepContext, StepHandler, StepKind, StepOutput, StepPredicate, StepSpec, TriggerCondition,
};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
