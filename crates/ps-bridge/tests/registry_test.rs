use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ps_bridge::{CallError, Connection, ConnectionContext, ConnectionRegistry, EventBus, ServerEvent};
use ps_core::types::ClientQuery;
use ps_queue::catalog::PluginCatalog;
use ps_queue::queue::MessageQueue;
use ps_queue::state::PluginStateStore;
use ps_queue::stats::BackgroundStats;
use ps_queue::{FnReducer, MessageScheduler, PersistedStateReducer, PluginDefinition, PluginHost};
use ps_telemetry::metrics::{names, MetricsCollector};
use serde_json::{json, Value};

fn query() -> ClientQuery {
    ClientQuery::new("Demo", "iOS", "iPhone", "serial-9").with_sdk_version(3)
}

fn connect(metrics: &Arc<MetricsCollector>) -> (Arc<Connection>, flume::Receiver<Bytes>) {
    Connection::new(query(), ConnectionContext::new(Arc::clone(metrics)))
}

fn registry() -> (ConnectionRegistry, flume::Receiver<ServerEvent>, Arc<MetricsCollector>) {
    let metrics = Arc::new(MetricsCollector::with_defaults());
    let bus = EventBus::new();
    let events = bus.subscribe();
    (ConnectionRegistry::new(bus, Arc::clone(&metrics)), events, metrics)
}

fn drain(events: &flume::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    events.try_iter().collect()
}

fn noop() -> Arc<dyn PersistedStateReducer> {
    Arc::new(FnReducer::new(json!([]), |state: &Value, _method: &str, _params: &Value| {
        Ok(state.clone())
    }))
}

#[tokio::test]
async fn register_announces_the_client() {
    let (registry, events, metrics) = registry();
    let (conn, _outbound) = connect(&metrics);

    assert!(registry.register(Arc::clone(&conn)).is_none());
    assert!(registry.contains(conn.id()));
    assert_eq!(registry.len(), 1);
    assert_eq!(metrics.get_gauge(names::CONNECTED_CLIENTS), 1);

    let events = drain(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ServerEvent::NewClient(c) if Arc::ptr_eq(c, &conn)));
    assert!(matches!(events[1], ServerEvent::ClientsChange));
}

#[tokio::test]
async fn newer_connection_replaces_the_older_one() {
    let (registry, events, metrics) = registry();
    let (old, old_outbound) = connect(&metrics);
    let (new, _new_outbound) = connect(&metrics);
    registry.register(Arc::clone(&old));
    drain(&events);

    let waiting = tokio::spawn({
        let old = Arc::clone(&old);
        async move { old.call("slow", Value::Null).await }
    });
    tokio::time::timeout(Duration::from_secs(1), old_outbound.recv_async())
        .await
        .unwrap()
        .unwrap();

    let replaced = registry.register(Arc::clone(&new)).expect("old connection replaced");
    assert!(Arc::ptr_eq(&replaced, &old));
    assert!(!old.is_connected());
    assert!(matches!(waiting.await.unwrap(), Err(CallError::ConnectionReplaced)));
    assert!(Arc::ptr_eq(&registry.get(new.id()).unwrap(), &new));
    assert_eq!(registry.len(), 1);

    let drained = drain(&events);
    assert!(matches!(&drained[0], ServerEvent::RemovedClient(id) if id == old.id()));
    assert!(matches!(&drained[1], ServerEvent::NewClient(c) if Arc::ptr_eq(c, &new)));

    // The stale connection finishing later leaves its successor alone.
    assert!(!registry.remove(&old));
    assert!(registry.contains(new.id()));
    assert!(drain(&events).is_empty());
}

#[tokio::test]
async fn re_registering_the_same_connection_is_not_a_replacement() {
    let (registry, _events, metrics) = registry();
    let (conn, _outbound) = connect(&metrics);
    registry.register(Arc::clone(&conn));
    assert!(registry.register(Arc::clone(&conn)).is_none());
    assert!(conn.is_connected());
}

#[tokio::test]
async fn remove_announces_and_updates_the_gauge() {
    let (registry, events, metrics) = registry();
    let (conn, _outbound) = connect(&metrics);
    registry.register(Arc::clone(&conn));
    drain(&events);

    assert!(registry.remove(&conn));
    assert!(registry.is_empty());
    assert_eq!(metrics.get_gauge(names::CONNECTED_CLIENTS), 0);

    let events = drain(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ServerEvent::RemovedClient(id) if id == conn.id()));
    assert!(matches!(events[1], ServerEvent::ClientsChange));

    assert!(!registry.remove(&conn));
}

#[tokio::test]
async fn removal_drops_client_queues_but_keeps_device_queues() {
    let catalog = Arc::new(PluginCatalog::new());
    catalog.register(PluginDefinition::client("Network").with_reducer(noop()));
    catalog.register(PluginDefinition::device("Logs").with_reducer(noop()));
    let scheduler = Arc::new(MessageScheduler::new(
        Arc::new(MessageQueue::default()),
        Arc::new(PluginStateStore::new()),
        Arc::new(BackgroundStats::default()),
    ));
    let host = Arc::new(PluginHost::new(catalog, scheduler));

    let (registry, _events, metrics) = registry();
    let registry = registry.with_host(Arc::clone(&host));
    let (conn, _outbound) = connect(&metrics);
    registry.register(Arc::clone(&conn));

    let serial = conn.query().device_id.clone();
    host.handle_execute(conn.id(), &serial, "Network", "request", json!({})).unwrap();
    host.handle_execute(conn.id(), &serial, "Logs", "line", json!({})).unwrap();
    let network = host.plugin_key(conn.id(), &serial, "Network").unwrap();
    let logs = host.plugin_key(conn.id(), &serial, "Logs").unwrap();

    registry.remove(&conn);

    let queue = host.scheduler().queue();
    assert_eq!(queue.len(&network), 0);
    assert_eq!(queue.len(&logs), 1);
}

#[tokio::test]
async fn close_all_closes_every_connection() {
    let (registry, _events, metrics) = registry();
    let first = Connection::new(query(), ConnectionContext::new(Arc::clone(&metrics))).0;
    let second = Connection::new(
        ClientQuery::new("Other", "iOS", "iPhone", "serial-9"),
        ConnectionContext::new(Arc::clone(&metrics)),
    )
    .0;
    registry.register(Arc::clone(&first));
    registry.register(Arc::clone(&second));

    registry.close_all();
    assert!(!first.is_connected());
    assert!(!second.is_connected());
    // Entries go away when their serve loops finish.
    assert_eq!(registry.len(), 2);
}
