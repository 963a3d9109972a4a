use crate::{FlowId, SchedulerStats, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted by the engine, scheduler and orchestrator.
///
/// Delivered synchronously at the point of occurrence; subscribers that fall
/// behind the channel capacity lose the oldest events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowRegistered {
        flow_id: FlowId,
        priority: i32,
        dependencies: Vec<FlowId>,
        timestamp: DateTime<Utc>,
    },
    FlowStarted {
        flow_id: FlowId,
        execution_id: ExecutionId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        flow_id: FlowId,
        execution_id: ExecutionId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    FlowError {
        flow_id: FlowId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    SchedulerStats {
        stats: SchedulerStats,
        timestamp: DateTime<Utc>,
    },
    SchedulerStalled {
        blocked: Vec<FlowId>,
        timestamp: DateTime<Utc>,
    },
    RunStarted {
        execution_id: ExecutionId,
        flow_name: String,
        state_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        execution_id: ExecutionId,
        flow_name: String,
        stopped: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step: String,
        output: Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        execution_id: ExecutionId,
        step: String,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Messages a step can publish while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { key: String, value: Value },
}

/// Event emitter handed to each step invocation
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    step: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        step: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            step: step.into(),
            sender,
        }
    }

    pub fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(ExecutionEvent::StepEvent {
            execution_id: self.execution_id,
            step: self.step.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }

    pub fn data(&self, key: impl Into<String>, value: Value) {
        self.emit(StepEvent::Data {
            key: key.into(),
            value,
        });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, step: &str) -> EventEmitter {
        EventEmitter::new(execution_id, step, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
