use std::collections::VecDeque;

use dashmap::DashMap;
use ps_core::types::PluginKey;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub method: String,
    pub params: Value,
}

impl QueuedMessage {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Pending plugin messages, one FIFO per plugin key.
///
/// Queues are never truncated; crossing `warn_threshold` is only logged.
#[derive(Debug)]
pub struct MessageQueue {
    queues: DashMap<PluginKey, VecDeque<QueuedMessage>>,
    warn_threshold: usize,
}

impl MessageQueue {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            queues: DashMap::new(),
            warn_threshold,
        }
    }

    pub fn push(&self, key: &PluginKey, message: QueuedMessage) {
        let len = {
            let mut queue = self.queues.entry(key.clone()).or_default();
            queue.push_back(message);
            queue.len()
        };
        if self.warn_threshold > 0 && len % self.warn_threshold == 0 {
            warn!(plugin_key = %key, len, "plugin message queue is growing");
        }
    }

    pub fn front(&self, key: &PluginKey) -> Option<QueuedMessage> {
        self.queues.get(key).and_then(|q| q.front().cloned())
    }

    /// Remove the oldest message; the entry itself goes once it is empty.
    pub fn pop_front(&self, key: &PluginKey) -> Option<QueuedMessage> {
        let popped = self.queues.get_mut(key).and_then(|mut q| q.pop_front());
        self.queues.remove_if(key, |_, q| q.is_empty());
        popped
    }

    pub fn len(&self, key: &PluginKey) -> usize {
        self.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &PluginKey) -> bool {
        self.len(key) == 0
    }

    pub fn contains_key(&self, key: &PluginKey) -> bool {
        self.queues.contains_key(key)
    }

    /// Copy of the pending messages, oldest first.
    pub fn messages(&self, key: &PluginKey) -> Vec<QueuedMessage> {
        self.queues
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete the entry for `key`, returning how many messages it held.
    pub fn remove(&self, key: &PluginKey) -> usize {
        self.queues.remove(key).map(|(_, q)| q.len()).unwrap_or(0)
    }

    /// Delete every entry scoped under `owner` (a client id or device
    /// serial). Returns the keys removed.
    pub fn remove_owned_by(&self, owner: &str) -> Vec<PluginKey> {
        let keys: Vec<PluginKey> = self
            .queues
            .iter()
            .filter(|entry| entry.key().belongs_to(owner))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.queues.remove(key);
        }
        keys
    }

    pub fn keys(&self) -> Vec<PluginKey> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}
