use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Mutable record owned by a single flow run.
///
/// Steps read and write fields directly through the shared handle in their
/// context. The id survives persistence round trips so a run can be resumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowState {
    pub id: Uuid,
    pub fields: BTreeMap<String, Value>,
}

impl FlowState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_fields(fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Overwrite fields with the given entries, keeping everything else.
    pub fn merge(&mut self, entries: BTreeMap<String, Value>) {
        self.fields.extend(entries);
    }

    /// Snapshot as an object value, including the state id.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        Value::Object(map)
    }
}

impl Default for FlowState {
    fn default() -> Self {
        Self::new()
    }
}
