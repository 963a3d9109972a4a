use std::collections::{HashMap, VecDeque};

/// Outlier-resistant duration estimates from a bounded window of recent runs
/// per flow type.
#[derive(Debug, Clone)]
pub struct DurationPredictor {
    window: usize,
    default_ms: f64,
    per_dependency_ms: f64,
    history: HashMap<String, VecDeque<f64>>,
}

impl DurationPredictor {
    pub fn new(window: usize, default_ms: f64, per_dependency_ms: f64) -> Self {
        Self {
            window: window.max(1),
            default_ms,
            per_dependency_ms,
            history: HashMap::new(),
        }
    }

    pub fn record(&mut self, flow_type: &str, duration_ms: f64) {
        let samples = self.history.entry(flow_type.to_string()).or_default();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    /// With four or more samples the top and bottom quartiles are dropped
    /// before averaging; fewer samples are averaged as is; no history falls
    /// back to a guess from the dependency count.
    pub fn predict(&self, flow_type: &str, dependency_count: usize) -> f64 {
        let Some(samples) = self.history.get(flow_type).filter(|s| !s.is_empty()) else {
            return self.default_ms + self.per_dependency_ms * dependency_count as f64;
        };

        if samples.len() < 4 {
            return samples.iter().sum::<f64>() / samples.len() as f64;
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let quartile = sorted.len() / 4;
        let trimmed = &sorted[quartile..sorted.len() - quartile];
        trimmed.iter().sum::<f64>() / trimmed.len() as f64
    }

    pub fn samples(&self, flow_type: &str) -> usize {
        self.history.get(flow_type).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
