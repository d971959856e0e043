use std::sync::Arc;

use dashmap::DashMap;
use ps_core::types::ClientId;
use ps_queue::PluginHost;
use ps_telemetry::metrics::{names, MetricsCollector};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::event_bus::EventBus;
use crate::events::ServerEvent;

/// Live secure connections by [`ClientId`].
///
/// At most one connection per id: registering a newer one force-closes the
/// older, and a stale connection finishing later cannot remove its successor.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<Connection>>,
    events: EventBus<ServerEvent>,
    host: Option<Arc<PluginHost>>,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionRegistry {
    pub fn new(events: EventBus<ServerEvent>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            connections: DashMap::new(),
            events,
            host: None,
            metrics,
        }
    }

    /// Queues of removed connections are deleted through `host`.
    pub fn with_host(mut self, host: Arc<PluginHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    /// Returns the connection that was replaced, if any.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let id = connection.id().clone();
        let replaced = self
            .connections
            .insert(id.clone(), Arc::clone(&connection))
            .filter(|previous| !Arc::ptr_eq(previous, &connection));

        // Queues stay: they are keyed by the id the new connection now owns.
        if let Some(previous) = &replaced {
            warn!(client_id = %id, "replacing stale connection");
            previous.force_close();
            self.events.publish(ServerEvent::RemovedClient(id.clone()));
        }

        info!(client_id = %id, "client connected");
        self.events.publish(ServerEvent::NewClient(connection));
        self.events.publish(ServerEvent::ClientsChange);
        self.update_gauge();
        replaced
    }

    /// Remove `connection` if it is still the registered one for its id.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let id = connection.id();
        let removed = self
            .connections
            .remove_if(id, |_, current| Arc::ptr_eq(current, connection))
            .is_some();
        if removed {
            info!(client_id = %id, "client disconnected");
            if let Some(host) = &self.host {
                host.connection_closed(id);
            }
            self.events.publish(ServerEvent::RemovedClient(id.clone()));
            self.events.publish(ServerEvent::ClientsChange);
            self.update_gauge();
        }
        removed
    }

    fn update_gauge(&self) {
        self.metrics
            .set_gauge(names::CONNECTED_CLIENTS, self.connections.len() as i64);
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close every connection. Their serve loops then remove them.
    pub fn close_all(&self) {
        for connection in self.connections() {
            connection.close();
        }
    }
}
