use std::fmt;
use std::sync::Arc;

use ps_core::types::{ClientId, PluginKey};
use serde_json::Value;

/// Failure raised by a plugin reducer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ReducerError {
    pub message: String,
}

impl ReducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Folds plugin events into the state a plugin exposes.
///
/// Reducers must be pure: the same state, method and params always produce
/// the same result, which is what makes deferred draining equivalent to
/// immediate application.
pub trait PersistedStateReducer: Send + Sync {
    /// State a plugin starts from before any event was applied.
    fn default_persisted_state(&self) -> Value;

    fn reduce(&self, state: &Value, method: &str, params: &Value) -> Result<Value, ReducerError>;
}

/// Adapts a closure into a [`PersistedStateReducer`].
pub struct FnReducer<F> {
    default_state: Value,
    reduce: F,
}

impl<F> FnReducer<F>
where
    F: Fn(&Value, &str, &Value) -> Result<Value, ReducerError> + Send + Sync,
{
    pub fn new(default_state: Value, reduce: F) -> Self {
        Self {
            default_state,
            reduce,
        }
    }
}

impl<F> PersistedStateReducer for FnReducer<F>
where
    F: Fn(&Value, &str, &Value) -> Result<Value, ReducerError> + Send + Sync,
{
    fn default_persisted_state(&self) -> Value {
        self.default_state.clone()
    }

    fn reduce(&self, state: &Value, method: &str, params: &Value) -> Result<Value, ReducerError> {
        (self.reduce)(state, method, params)
    }
}

// ---------------------------------------------------------------------------
// PluginDefinition
// ---------------------------------------------------------------------------

/// A plugin known to the host.
///
/// Client plugins belong to one app connection. Device plugins belong to the
/// device and keep their state across app reconnects.
#[derive(Clone)]
pub enum PluginDefinition {
    Client {
        id: String,
        reducer: Option<Arc<dyn PersistedStateReducer>>,
    },
    Device {
        id: String,
        reducer: Option<Arc<dyn PersistedStateReducer>>,
    },
}

impl PluginDefinition {
    pub fn client(id: impl Into<String>) -> Self {
        PluginDefinition::Client {
            id: id.into(),
            reducer: None,
        }
    }

    pub fn device(id: impl Into<String>) -> Self {
        PluginDefinition::Device {
            id: id.into(),
            reducer: None,
        }
    }

    pub fn with_reducer(self, reducer: Arc<dyn PersistedStateReducer>) -> Self {
        match self {
            PluginDefinition::Client { id, .. } => PluginDefinition::Client {
                id,
                reducer: Some(reducer),
            },
            PluginDefinition::Device { id, .. } => PluginDefinition::Device {
                id,
                reducer: Some(reducer),
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            PluginDefinition::Client { id, .. } | PluginDefinition::Device { id, .. } => id,
        }
    }

    pub fn reducer(&self) -> Option<&Arc<dyn PersistedStateReducer>> {
        match self {
            PluginDefinition::Client { reducer, .. } | PluginDefinition::Device { reducer, .. } => {
                reducer.as_ref()
            }
        }
    }

    /// True when events for this plugin are folded into persisted state
    /// rather than delivered to subscribers.
    pub fn is_persistent(&self) -> bool {
        self.reducer().is_some()
    }

    pub fn is_device_plugin(&self) -> bool {
        matches!(self, PluginDefinition::Device { .. })
    }

    /// Queue/state scope for this plugin on the given connection.
    pub fn plugin_key(&self, client: &ClientId, device_serial: &str) -> PluginKey {
        match self {
            PluginDefinition::Client { id, .. } => PluginKey::for_client(client, id),
            PluginDefinition::Device { id, .. } => PluginKey::for_device(device_serial, id),
        }
    }
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_device_plugin() { "Device" } else { "Client" };
        f.debug_struct(kind)
            .field("id", &self.id())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
