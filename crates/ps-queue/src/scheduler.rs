use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use ps_core::types::PluginKey;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::idler::Idler;
use crate::plugin::{PersistedStateReducer, PluginDefinition, ReducerError};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::state::PluginStateStore;
use crate::stats::BackgroundStats;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// The reducer rejected a message. Messages before it stay applied and
    /// the offending message stays at the head of the queue.
    #[error("reducer for {plugin_key} failed on {method}: {source}")]
    Reducer {
        plugin_key: PluginKey,
        method: String,
        #[source]
        source: ReducerError,
    },

    #[error("plugin {0} has no persisted state reducer")]
    NotPersistent(String),

    #[error("unknown plugin {0}")]
    UnknownPlugin(String),
}

/// How an incoming message was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue was empty when the drain last looked.
    Completed { applied: usize },
    /// The idler cancelled; `remaining` messages are still queued.
    Cancelled { applied: usize, remaining: usize },
    /// Another drain of the same key is in flight.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainProgress {
    pub current: usize,
    pub total: usize,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(DrainProgress) + Send + Sync);

// ---------------------------------------------------------------------------
// MessageScheduler
// ---------------------------------------------------------------------------

/// Decides whether plugin messages are applied now or queued, and drains
/// queues cooperatively.
///
/// Each key has a lock held only while one message is folded into state and
/// removed from the queue, never across an await. That step is what makes a
/// drain resumable: whatever it applied is already committed.
#[derive(Debug)]
pub struct MessageScheduler {
    queue: Arc<MessageQueue>,
    states: Arc<PluginStateStore>,
    stats: Arc<BackgroundStats>,
    selected: RwLock<Option<PluginKey>>,
    key_locks: DashMap<PluginKey, Arc<Mutex<()>>>,
    draining: DashMap<PluginKey, ()>,
}

impl MessageScheduler {
    pub fn new(
        queue: Arc<MessageQueue>,
        states: Arc<PluginStateStore>,
        stats: Arc<BackgroundStats>,
    ) -> Self {
        Self {
            queue,
            states,
            stats,
            selected: RwLock::new(None),
            key_locks: DashMap::new(),
            draining: DashMap::new(),
        }
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn states(&self) -> &Arc<PluginStateStore> {
        &self.states
    }

    pub fn stats(&self) -> &Arc<BackgroundStats> {
        &self.stats
    }

    // -- Selection ------------------------------------------------------------

    /// Make `key` the live plugin. Already queued messages still need a
    /// drain before new messages are applied directly.
    pub fn select(&self, key: PluginKey) {
        debug!(plugin_key = %key, "plugin selected");
        *self.selected.write().expect("scheduler lock poisoned") = Some(key);
    }

    pub fn deselect(&self) {
        *self.selected.write().expect("scheduler lock poisoned") = None;
    }

    pub fn selected(&self) -> Option<PluginKey> {
        self.selected.read().expect("scheduler lock poisoned").clone()
    }

    pub fn is_selected(&self, key: &PluginKey) -> bool {
        self.selected.read().expect("scheduler lock poisoned").as_ref() == Some(key)
    }

    // -- Delivery -------------------------------------------------------------

    /// Apply the message now when the plugin is live with nothing pending,
    /// otherwise append it to the plugin's queue.
    pub fn process_message_later(
        &self,
        plugin: &PluginDefinition,
        key: &PluginKey,
        method: &str,
        params: Value,
    ) -> Result<Delivery, DrainError> {
        let reducer = require_reducer(plugin)?;
        let lock = self.key_lock(key);
        let _held = lock.lock().expect("scheduler lock poisoned");

        if self.is_selected(key) && self.queue.is_empty(key) {
            self.apply(plugin.id(), reducer, key, method, &params)?;
            return Ok(Delivery::Applied);
        }
        self.queue.push(key, QueuedMessage::new(method, params));
        Ok(Delivery::Queued)
    }

    /// Apply the message regardless of selection or pending messages.
    pub fn process_message_immediately(
        &self,
        plugin: &PluginDefinition,
        key: &PluginKey,
        method: &str,
        params: &Value,
    ) -> Result<(), DrainError> {
        let reducer = require_reducer(plugin)?;
        let lock = self.key_lock(key);
        let _held = lock.lock().expect("scheduler lock poisoned");
        self.apply(plugin.id(), reducer, key, method, params)
    }

    /// Current persisted state, or the plugin default when nothing was applied.
    pub fn persisted_state(&self, plugin: &PluginDefinition, key: &PluginKey) -> Option<Arc<Value>> {
        let reducer = plugin.reducer()?;
        Some(self.states.get_or_else(key, || reducer.default_persisted_state()))
    }

    // -- Draining -------------------------------------------------------------

    /// Fold queued messages for `key` into its persisted state, oldest first.
    ///
    /// Messages queued while the drain runs are picked up by the same drain.
    /// Cancellation leaves the rest queued; nothing applied is rolled back.
    pub async fn drain(
        &self,
        plugin: &PluginDefinition,
        key: &PluginKey,
        idler: &dyn Idler,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<DrainOutcome, DrainError> {
        let reducer = require_reducer(plugin)?;
        let Some(_running) = DrainGuard::acquire(&self.draining, key) else {
            debug!(plugin_key = %key, "drain already in progress");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let initial = self.queue.len(key);
        let mut applied = 0usize;
        loop {
            if !self.apply_front(plugin.id(), reducer, key)? {
                break;
            }
            applied += 1;

            if let Some(report) = progress {
                report(DrainProgress {
                    current: applied,
                    total: initial.max(applied),
                });
            }

            if idler.is_cancelled() {
                let remaining = self.queue.len(key);
                info!(plugin_key = %key, applied, remaining, "drain cancelled");
                return Ok(DrainOutcome::Cancelled { applied, remaining });
            }
            if idler.should_idle() {
                idler.idle().await;
            }
        }

        if applied > 0 {
            debug!(plugin_key = %key, applied, "drain completed");
        }
        Ok(DrainOutcome::Completed { applied })
    }

    pub fn is_draining(&self, key: &PluginKey) -> bool {
        self.draining.contains_key(key)
    }

    // -- Teardown -------------------------------------------------------------

    /// Delete the queues and persisted state of every plugin scoped under a
    /// connection or device. Returns the number of queues deleted.
    pub fn clear_owner(&self, owner: &str) -> usize {
        let removed = self.queue.remove_owned_by(owner);
        for key in &removed {
            self.key_locks.remove(key);
        }
        let states = self.states.remove_owned_by(owner);
        if !removed.is_empty() || states > 0 {
            debug!(owner, queues = removed.len(), states, "plugin queues deleted");
        }
        removed.len()
    }

    /// Delete the queue and persisted state of one plugin.
    pub fn clear_plugin(&self, key: &PluginKey) {
        let dropped = self.queue.remove(key);
        self.states.remove(key);
        self.key_locks.remove(key);
        if dropped > 0 {
            warn!(plugin_key = %key, dropped, "plugin torn down with queued messages");
        }
    }

    // -- Internals ------------------------------------------------------------

    fn key_lock(&self, key: &PluginKey) -> Arc<Mutex<()>> {
        Arc::clone(self.key_locks.entry(key.clone()).or_default().value())
    }

    /// Apply and dequeue the oldest message. Returns false when none is left.
    fn apply_front(
        &self,
        plugin_id: &str,
        reducer: &Arc<dyn PersistedStateReducer>,
        key: &PluginKey,
    ) -> Result<bool, DrainError> {
        let lock = self.key_lock(key);
        let _held = lock.lock().expect("scheduler lock poisoned");

        let Some(message) = self.queue.front(key) else {
            return Ok(false);
        };
        self.apply(plugin_id, reducer, key, &message.method, &message.params)?;
        self.queue.pop_front(key);
        Ok(true)
    }

    /// Caller holds the key lock.
    fn apply(
        &self,
        plugin_id: &str,
        reducer: &Arc<dyn PersistedStateReducer>,
        key: &PluginKey,
        method: &str,
        params: &Value,
    ) -> Result<(), DrainError> {
        let state = self
            .states
            .get_or_else(key, || reducer.default_persisted_state());
        let started = Instant::now();
        let result = reducer.reduce(&state, method, params);
        self.stats.record(plugin_id, method, started.elapsed());

        match result {
            Ok(next) => {
                self.states.set(key, next);
                Ok(())
            }
            Err(source) => {
                warn!(plugin_key = %key, method, error = %source, "plugin reducer failed");
                Err(DrainError::Reducer {
                    plugin_key: key.clone(),
                    method: method.to_string(),
                    source,
                })
            }
        }
    }
}

fn require_reducer(plugin: &PluginDefinition) -> Result<&Arc<dyn PersistedStateReducer>, DrainError> {
    plugin
        .reducer()
        .ok_or_else(|| DrainError::NotPersistent(plugin.id().to_string()))
}

/// Marks a key as being drained for as long as it lives.
struct DrainGuard<'a> {
    draining: &'a DashMap<PluginKey, ()>,
    key: PluginKey,
}

impl<'a> DrainGuard<'a> {
    fn acquire(draining: &'a DashMap<PluginKey, ()>, key: &PluginKey) -> Option<Self> {
        match draining.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    draining,
                    key: key.clone(),
                })
            }
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.draining.remove(&self.key);
    }
}
