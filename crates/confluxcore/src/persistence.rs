use crate::{FlowError, FlowState};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for flow state, keyed by state id.
///
/// The engine saves at run start and after every executed step. Failures are
/// logged by the engine and never abort a run.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn save_state(&self, flow_name: &str, state: &FlowState) -> Result<(), FlowError>;

    async fn load_state(&self, id: Uuid) -> Result<Option<FlowState>, FlowError>;
}

/// Process-local persistence, mostly useful for tests and resumable demos
#[derive(Default)]
pub struct InMemoryStatePersistence {
    states: RwLock<HashMap<Uuid, (String, FlowState)>>,
}

impl InMemoryStatePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl StatePersistence for InMemoryStatePersistence {
    async fn save_state(&self, flow_name: &str, state: &FlowState) -> Result<(), FlowError> {
        tracing::debug!("Saving state {} for flow {}", state.id, flow_name);
        self.states
            .write()
            .await
            .insert(state.id, (flow_name.to_string(), state.clone()));
        Ok(())
    }

    async fn load_state(&self, id: Uuid) -> Result<Option<FlowState>, FlowError> {
        let state = self
            .states
            .read()
            .await
            .get(&id)
            .map(|(_, state)| state.clone());
        if state.is_none() {
            tracing::debug!("No saved state {}", id);
        }
        Ok(state)
    }
}
