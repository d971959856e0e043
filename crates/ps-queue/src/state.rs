use std::sync::Arc;

use dashmap::DashMap;
use ps_core::types::PluginKey;
use serde_json::Value;

/// Persisted plugin state by plugin key.
///
/// Values are shared so readers never copy a large state just to look at it.
#[derive(Debug, Default)]
pub struct PluginStateStore {
    states: DashMap<PluginKey, Arc<Value>>,
}

impl PluginStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PluginKey) -> Option<Arc<Value>> {
        self.states.get(key).map(|s| Arc::clone(&s))
    }

    pub fn get_or_else(&self, key: &PluginKey, default: impl FnOnce() -> Value) -> Arc<Value> {
        self.get(key).unwrap_or_else(|| Arc::new(default()))
    }

    pub fn set(&self, key: &PluginKey, state: Value) {
        self.states.insert(key.clone(), Arc::new(state));
    }

    pub fn remove(&self, key: &PluginKey) -> Option<Arc<Value>> {
        self.states.remove(key).map(|(_, s)| s)
    }

    pub fn remove_owned_by(&self, owner: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|key, _| !key.belongs_to(owner));
        before - self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
