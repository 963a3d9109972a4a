use confluxcore::{StepPredicate, TriggerCondition};
use std::collections::{BTreeSet, HashMap};

/// Index from completed step names to the listeners they may trigger.
///
/// Owns the pending set of every `All` listener: a name is removed when that
/// step completes and the listener fires once the set is empty, after which
/// the set is re-armed for the next cycle.
#[derive(Default)]
pub struct ListenerIndex {
    by_source: HashMap<String, Vec<String>>,
    on_failure: HashMap<String, Vec<String>>,
    predicates: Vec<(String, StepPredicate)>,
    conditions: HashMap<String, TriggerCondition>,
    and_pending: HashMap<String, BTreeSet<String>>,
}

impl ListenerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: &str, condition: &TriggerCondition) {
        match condition {
            TriggerCondition::Predicate(predicate) => {
                self.predicates
                    .push((listener.to_string(), predicate.clone()));
            }
            TriggerCondition::Failure(source) => {
                self.on_failure
                    .entry(source.clone())
                    .or_default()
                    .push(listener.to_string());
            }
            TriggerCondition::All(required) => {
                self.and_pending
                    .insert(listener.to_string(), required.clone());
                self.index_sources(listener, condition);
            }
            TriggerCondition::Simple(_) | TriggerCondition::Any(_) => {
                self.index_sources(listener, condition);
            }
        }
        self.conditions
            .insert(listener.to_string(), condition.clone());
    }

    fn index_sources(&mut self, listener: &str, condition: &TriggerCondition) {
        for source in condition.sources() {
            let listeners = self.by_source.entry(source.to_string()).or_default();
            if !listeners.iter().any(|l| l == listener) {
                listeners.push(listener.to_string());
            }
        }
    }

    /// Listeners triggered by a successful completion of `source`, in
    /// registration order. Predicate listeners are evaluated separately.
    pub fn on_completion(&mut self, source: &str) -> Vec<String> {
        let Some(candidates) = self.by_source.get(source) else {
            return Vec::new();
        };

        let mut triggered = Vec::new();
        for listener in candidates {
            match self.conditions.get(listener) {
                Some(TriggerCondition::Simple(_)) | Some(TriggerCondition::Any(_)) => {
                    triggered.push(listener.clone());
                }
                Some(TriggerCondition::All(required)) => {
                    let Some(pending) = self.and_pending.get_mut(listener) else {
                        continue;
                    };
                    pending.remove(source);
                    if pending.is_empty() {
                        *pending = required.clone();
                        triggered.push(listener.clone());
                    }
                }
                _ => {}
            }
        }
        triggered
    }

    pub fn failure_listeners(&self, source: &str) -> Vec<String> {
        self.on_failure.get(source).cloned().unwrap_or_default()
    }

    pub fn has_failure_listener(&self, source: &str) -> bool {
        self.on_failure
            .get(source)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    pub fn predicate_listeners(&self) -> &[(String, StepPredicate)] {
        &self.predicates
    }

    /// Names an `All` listener is still waiting on.
    pub fn pending_for(&self, listener: &str) -> Option<&BTreeSet<String>> {
        self.and_pending.get(listener)
    }

    /// Re-arm every `All` listener for a fresh run.
    pub fn reset(&mut self) {
        for (listener, pending) in self.and_pending.iter_mut() {
            if let Some(TriggerCondition::All(required)) = self.conditions.get(listener) {
                *pending = required.clone();
            }
        }
    }
}
