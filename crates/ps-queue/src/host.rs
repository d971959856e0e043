use std::sync::Arc;

use ps_core::types::{ClientId, PluginKey};
use serde_json::Value;

use crate::catalog::PluginCatalog;
use crate::idler::Idler;
use crate::scheduler::{Delivery, DrainError, DrainOutcome, MessageScheduler, ProgressCallback};

/// What the host did with an `execute` broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDelivery {
    /// Folded into the live plugin's state.
    Applied,
    /// Queued for a later drain.
    Queued,
    /// The api is not a persistent plugin; deliver to subscribers instead.
    NotPersistent,
}

impl From<Delivery> for HostDelivery {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Applied => HostDelivery::Applied,
            Delivery::Queued => HostDelivery::Queued,
        }
    }
}

/// Front door for plugin events coming off connections.
#[derive(Debug)]
pub struct PluginHost {
    catalog: Arc<PluginCatalog>,
    scheduler: Arc<MessageScheduler>,
}

impl PluginHost {
    pub fn new(catalog: Arc<PluginCatalog>, scheduler: Arc<MessageScheduler>) -> Self {
        Self { catalog, scheduler }
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    pub fn scheduler(&self) -> &Arc<MessageScheduler> {
        &self.scheduler
    }

    /// Key under which `plugin_id` keeps its queue and state for a connection.
    pub fn plugin_key(&self, client: &ClientId, device_serial: &str, plugin_id: &str) -> Option<PluginKey> {
        self.catalog
            .get(plugin_id)
            .map(|plugin| plugin.plugin_key(client, device_serial))
    }

    pub fn handle_execute(
        &self,
        client: &ClientId,
        device_serial: &str,
        plugin_id: &str,
        method: &str,
        params: Value,
    ) -> Result<HostDelivery, DrainError> {
        let Some(plugin) = self.catalog.get(plugin_id).filter(|p| p.is_persistent()) else {
            return Ok(HostDelivery::NotPersistent);
        };
        let key = plugin.plugin_key(client, device_serial);
        self.scheduler
            .process_message_later(&plugin, &key, method, params)
            .map(HostDelivery::from)
    }

    /// Make a plugin live and drain whatever queued up while it was not.
    pub async fn select_plugin(
        &self,
        plugin_id: &str,
        key: PluginKey,
        idler: &dyn Idler,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<DrainOutcome, DrainError> {
        let plugin = self
            .catalog
            .get(plugin_id)
            .ok_or_else(|| DrainError::UnknownPlugin(plugin_id.to_string()))?;
        self.scheduler.select(key.clone());
        if !plugin.is_persistent() {
            return Ok(DrainOutcome::Completed { applied: 0 });
        }
        self.scheduler.drain(&plugin, &key, idler, progress).await
    }

    pub fn deselect_plugin(&self) {
        self.scheduler.deselect();
    }

    /// Drop queued messages and plugin state of a connection that went away.
    pub fn connection_closed(&self, client: &ClientId) -> usize {
        self.scheduler.clear_owner(client.as_str())
    }
}
