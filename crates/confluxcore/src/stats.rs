use serde::{Deserialize, Serialize};

/// Fraction of each configured resource limit currently allocated
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
    pub network: f64,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
    pub total_dispatched: u64,
    pub backpressure_events: u64,
    pub priority_boosts: u64,
    pub avg_queue_wait_ms: f64,
    pub utilization: ResourceUtilization,
    pub stalled: bool,
}
