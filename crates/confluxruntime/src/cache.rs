use crate::config::EngineConfig;
use confluxcore::{StepOutput, Value};
use indexmap::IndexMap;
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry {
    output: StepOutput,
    inserted_at: Instant,
}

/// Bounded step-result cache keyed by step name and serialized input.
///
/// Entries live in insertion order, so the front of the map is always the
/// oldest entry.
pub struct MemoCache {
    entries: IndexMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    floor_entries: usize,
    max_entry_bytes: usize,
}

impl MemoCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            ttl: config.cache_ttl(),
            max_entries: config.cache_max_entries,
            floor_entries: config.cache_floor_entries.min(config.cache_max_entries),
            max_entry_bytes: config.cache_max_entry_bytes,
        }
    }

    /// Cache key for a step invocation, `None` when the input cannot be
    /// serialized.
    pub fn key(step: &str, input: &Value) -> Option<String> {
        input
            .canonical_string()
            .ok()
            .map(|serialized| format!("{step}:{serialized}"))
    }

    /// Fresh entry for `key`; an expired entry is dropped on the way.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<StepOutput> {
        let expired = match self.entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) < self.ttl => {
                return Some(entry.output.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.shift_remove(key);
        }
        None
    }

    /// Store a result. Returns false when the result is too large to cache.
    pub fn insert(&mut self, key: String, output: StepOutput, now: Instant) -> bool {
        let size = serde_json::to_string(&output.value)
            .map(|s| s.len())
            .unwrap_or(usize::MAX);
        if size > self.max_entry_bytes {
            tracing::debug!("Skipping cache for {} ({} bytes)", key, size);
            return false;
        }

        // Re-inserting moves the entry to the back so age order holds
        self.entries.shift_remove(&key);
        self.entries.insert(
            key,
            CacheEntry {
                output,
                inserted_at: now,
            },
        );

        if self.entries.len() > self.max_entries {
            self.evict(now);
        }
        true
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) < ttl);

        while self.entries.len() > self.floor_entries {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
