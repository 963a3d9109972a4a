use confluxcore::{FlowId, ValidationError};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const SLACK_TOLERANCE: f64 = 1e-9;

/// Schedule bounds for one flow, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTiming {
    pub duration: f64,
    pub earliest_start: f64,
    pub earliest_finish: f64,
    pub latest_start: f64,
    pub latest_finish: f64,
    pub slack: f64,
}

/// Longest dependency chain of an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Zero-slack flows ordered by earliest start
    pub path: Vec<FlowId>,
    pub total_time: f64,
    pub timings: BTreeMap<FlowId, NodeTiming>,
}

impl CriticalPath {
    pub fn contains(&self, id: &FlowId) -> bool {
        self.path.contains(id)
    }
}

/// Dependency DAG over flow ids; edges point from dependency to dependent.
pub struct DependencyGraph {
    graph: DiGraph<FlowId, ()>,
    indices: HashMap<FlowId, NodeIndex>,
}

impl DependencyGraph {
    pub fn build(ids: &[FlowId], edges: &[(FlowId, FlowId)]) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for id in ids {
            if indices.contains_key(id) {
                return Err(ValidationError::DuplicateFlow(id.to_string()));
            }
            let idx = graph.add_node(id.clone());
            indices.insert(id.clone(), idx);
        }

        for (dependency, dependent) in edges {
            let from = indices
                .get(dependency)
                .ok_or_else(|| ValidationError::FlowNotFound(dependency.to_string()))?;
            let to = indices
                .get(dependent)
                .ok_or_else(|| ValidationError::FlowNotFound(dependent.to_string()))?;
            graph.add_edge(*from, *to, ());
        }

        Ok(Self { graph, indices })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Topological order, or the cyclic dependency that prevents one.
    pub fn topological_order(&self) -> Result<Vec<FlowId>, ValidationError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].clone()).collect())
            .map_err(|cycle| {
                let id = self.graph[cycle.node_id()].clone();
                let dependency = self
                    .graph
                    .neighbors_directed(cycle.node_id(), Direction::Incoming)
                    .next()
                    .map(|idx| self.graph[idx].to_string())
                    .unwrap_or_else(|| id.to_string());
                ValidationError::CyclicDependency {
                    dependency,
                    dependent: id.to_string(),
                }
            })
    }

    pub fn node(&self, id: &FlowId) -> Option<NodeIndex> {
        self.indices.get(id).copied()
    }

    /// Forward and backward pass over the graph.
    ///
    /// Flows without a recorded duration count as zero. Both passes stop
    /// after one sweep per node, so a malformed graph still terminates.
    pub fn critical_path(&self, durations: &HashMap<FlowId, f64>) -> CriticalPath {
        let n = self.graph.node_count();
        if n == 0 {
            return CriticalPath::default();
        }

        let duration: Vec<f64> = self
            .graph
            .node_indices()
            .map(|idx| {
                durations
                    .get(&self.graph[idx])
                    .copied()
                    .filter(|d| d.is_finite() && *d >= 0.0)
                    .unwrap_or(0.0)
            })
            .collect();

        let mut earliest_start = vec![0.0_f64; n];
        let mut earliest_finish = duration.clone();
        for _ in 0..n {
            let mut changed = false;
            for idx in self.graph.node_indices() {
                let start = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .map(|dep| earliest_finish[dep.index()])
                    .fold(0.0_f64, f64::max);
                if start > earliest_start[idx.index()] {
                    earliest_start[idx.index()] = start;
                    earliest_finish[idx.index()] = start + duration[idx.index()];
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let total_time = earliest_finish.iter().copied().fold(0.0_f64, f64::max);

        let mut latest_finish = vec![total_time; n];
        let mut latest_start: Vec<f64> = duration.iter().map(|d| total_time - d).collect();
        for _ in 0..n {
            let mut changed = false;
            for idx in self.graph.node_indices() {
                let finish = self
                    .graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .map(|next| latest_start[next.index()])
                    .fold(total_time, f64::min);
                if finish < latest_finish[idx.index()] {
                    latest_finish[idx.index()] = finish;
                    latest_start[idx.index()] = finish - duration[idx.index()];
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut timings = BTreeMap::new();
        let mut critical = Vec::new();
        for idx in self.graph.node_indices() {
            let i = idx.index();
            let slack = latest_start[i] - earliest_start[i];
            let id = self.graph[idx].clone();
            if slack.abs() <= SLACK_TOLERANCE {
                critical.push((earliest_start[i], earliest_finish[i], i, id.clone()));
            }
            timings.insert(
                id,
                NodeTiming {
                    duration: duration[i],
                    earliest_start: earliest_start[i],
                    earliest_finish: earliest_finish[i],
                    latest_start: latest_start[i],
                    latest_finish: latest_finish[i],
                    slack,
                },
            );
        }

        critical.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        CriticalPath {
            path: critical.into_iter().map(|(_, _, _, id)| id).collect(),
            total_time,
            timings,
        }
    }
}

/// Check that a plan is non-empty and acyclic; returns a topological order.
pub fn validate_plan(
    ids: &[FlowId],
    edges: &[(FlowId, FlowId)],
) -> Result<Vec<FlowId>, ValidationError> {
    if ids.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }
    DependencyGraph::build(ids, edges)?.topological_order()
}

/// Critical path over the given flows using recorded durations.
pub fn compute_critical_path(
    ids: &[FlowId],
    edges: &[(FlowId, FlowId)],
    durations: &HashMap<FlowId, f64>,
) -> Result<CriticalPath, ValidationError> {
    Ok(DependencyGraph::build(ids, edges)?.critical_path(durations))
}
