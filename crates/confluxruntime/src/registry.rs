use confluxcore::{DependencyOptions, Flow, FlowId, FlowOptions, ValidationError, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A flow definition together with its registration options and the
/// options of every incoming dependency edge.
#[derive(Clone)]
pub struct RegisteredFlow {
    pub id: FlowId,
    pub flow: Arc<Flow>,
    pub options: FlowOptions,
    pub edges: BTreeMap<FlowId, DependencyOptions>,
}

impl RegisteredFlow {
    /// Inputs for one run: request data, then each dependency's result
    /// (through its edge mapping, or keyed by dependency id), then the
    /// flow-level mapping over all dependency results.
    pub fn assemble_inputs(
        &self,
        input_data: &BTreeMap<String, Value>,
        dependency_results: &BTreeMap<FlowId, Value>,
    ) -> BTreeMap<String, Value> {
        let mut inputs = input_data.clone();

        for (dependency, result) in dependency_results {
            match self.edges.get(dependency).and_then(|e| e.data_mapping.as_ref()) {
                Some(mapping) => inputs.extend(mapping(result)),
                None => {
                    inputs.insert(dependency.to_string(), result.clone());
                }
            }
        }

        if let Some(mapping) = &self.options.data_mapping {
            inputs.extend(mapping(dependency_results));
        }
        inputs
    }

    /// Whether this flow should run given its inputs and dependency results.
    /// Returns the reason when it should not.
    pub fn check_conditions(
        &self,
        inputs: &BTreeMap<String, Value>,
        dependency_results: &BTreeMap<FlowId, Value>,
    ) -> Result<(), String> {
        for (dependency, options) in &self.edges {
            let Some(condition) = &options.condition else {
                continue;
            };
            let result = dependency_results.get(dependency).unwrap_or(&Value::Null);
            if !condition(result) {
                return Err(format!("condition on dependency {} not met", dependency));
            }
        }

        if let Some(condition) = &self.options.condition {
            if !condition(inputs) {
                return Err("flow condition not met".to_string());
            }
        }
        Ok(())
    }
}

/// Registered flow definitions, in registration order
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<FlowId, RegisteredFlow>,
    order: Vec<FlowId>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: FlowId,
        flow: Flow,
        options: FlowOptions,
    ) -> Result<(), ValidationError> {
        if self.flows.contains_key(&id) {
            return Err(ValidationError::DuplicateFlow(id.to_string()));
        }

        tracing::info!("Registering flow: {} ({})", id, flow.name);
        let edges = options
            .dependencies
            .iter()
            .map(|dependency| (dependency.clone(), DependencyOptions::default()))
            .collect();
        self.flows.insert(
            id.clone(),
            RegisteredFlow {
                id: id.clone(),
                flow: Arc::new(flow),
                options,
                edges,
            },
        );
        self.order.push(id);
        Ok(())
    }

    /// Attach or replace the options on the edge dependency -> dependent.
    pub fn set_edge(
        &mut self,
        dependency: &FlowId,
        dependent: &FlowId,
        options: DependencyOptions,
    ) -> Result<(), ValidationError> {
        if !self.flows.contains_key(dependency) {
            return Err(ValidationError::FlowNotFound(dependency.to_string()));
        }
        let entry = self
            .flows
            .get_mut(dependent)
            .ok_or_else(|| ValidationError::FlowNotFound(dependent.to_string()))?;
        entry.edges.insert(dependency.clone(), options);
        Ok(())
    }

    pub fn get(&self, id: &FlowId) -> Option<&RegisteredFlow> {
        self.flows.get(id)
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.flows.contains_key(id)
    }

    pub fn ids(&self) -> &[FlowId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.flows.clear();
        self.order.clear();
    }
}
