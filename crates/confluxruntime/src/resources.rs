use confluxcore::{ResourceEstimate, ResourceUtilization};

/// Slack for floating-point accumulation when comparing against limits
const EPSILON: f64 = 1e-9;

/// Shared resource budget. Allocation and release are symmetric, so the sum
/// of running flows' estimates never exceeds the limits.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    limits: ResourceEstimate,
    allocated: ResourceEstimate,
}

impl ResourcePool {
    pub fn new(limits: ResourceEstimate) -> Self {
        Self {
            limits,
            allocated: ResourceEstimate::zero(),
        }
    }

    pub fn limits(&self) -> ResourceEstimate {
        self.limits
    }

    pub fn allocated(&self) -> ResourceEstimate {
        self.allocated
    }

    pub fn available(&self) -> ResourceEstimate {
        ResourceEstimate::new(
            (self.limits.cpu - self.allocated.cpu).max(0.0),
            (self.limits.memory - self.allocated.memory).max(0.0),
            (self.limits.io - self.allocated.io).max(0.0),
            (self.limits.network - self.allocated.network).max(0.0),
        )
    }

    pub fn can_allocate(&self, estimate: &ResourceEstimate) -> bool {
        self.allocated.cpu + estimate.cpu <= self.limits.cpu + EPSILON
            && self.allocated.memory + estimate.memory <= self.limits.memory + EPSILON
            && self.allocated.io + estimate.io <= self.limits.io + EPSILON
            && self.allocated.network + estimate.network <= self.limits.network + EPSILON
    }

    /// Reserve resources; false (and no change) when they do not fit.
    pub fn allocate(&mut self, estimate: &ResourceEstimate) -> bool {
        if !self.can_allocate(estimate) {
            return false;
        }
        self.allocated.cpu += estimate.cpu;
        self.allocated.memory += estimate.memory;
        self.allocated.io += estimate.io;
        self.allocated.network += estimate.network;
        true
    }

    pub fn release(&mut self, estimate: &ResourceEstimate) {
        self.allocated.cpu = (self.allocated.cpu - estimate.cpu).max(0.0);
        self.allocated.memory = (self.allocated.memory - estimate.memory).max(0.0);
        self.allocated.io = (self.allocated.io - estimate.io).max(0.0);
        self.allocated.network = (self.allocated.network - estimate.network).max(0.0);
    }

    pub fn utilization(&self) -> ResourceUtilization {
        fn ratio(used: f64, limit: f64) -> f64 {
            if limit > 0.0 {
                used / limit
            } else {
                0.0
            }
        }
        ResourceUtilization {
            cpu: ratio(self.allocated.cpu, self.limits.cpu),
            memory: ratio(self.allocated.memory, self.limits.memory),
            io: ratio(self.allocated.io, self.limits.io),
            network: ratio(self.allocated.network, self.limits.network),
        }
    }

    /// Higher is better: a flow that uses the currently scarce resources
    /// lightly scores close to 1.
    pub fn efficiency(&self, estimate: &ResourceEstimate) -> f64 {
        let utilization = self.utilization();
        let weighted = [
            (estimate.cpu, self.limits.cpu, utilization.cpu),
            (estimate.memory, self.limits.memory, utilization.memory),
            (estimate.io, self.limits.io, utilization.io),
            (estimate.network, self.limits.network, utilization.network),
        ]
        .iter()
        .map(|(amount, limit, used)| {
            let share = if *limit > 0.0 { amount / limit } else { 0.0 };
            share * (1.0 + used)
        })
        .sum::<f64>();
        1.0 / (1.0 + weighted)
    }

    pub fn reset(&mut self) {
        self.allocated = ResourceEstimate::zero();
    }
}
