use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ps_core::frame::{
    self, Api, CallFrame, DeviceError, ExecuteParams, InboundFrame, MessageId, ResponseOutcome,
    SendFrame, DEINIT, EXECUTE, GET_BACKGROUND_PLUGINS, GET_PLUGINS, INIT, IS_METHOD_SUPPORTED,
};
use ps_core::types::{ClientId, ClientQuery};
use ps_queue::PluginHost;
use ps_telemetry::metrics::{names, MetricsCollector};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::FramedStream;
use crate::event_bus::EventBus;
use crate::events::ClientEvent;
use crate::router::{Callback, MessageRouter};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("device rejected the call: {0}")]
    Rejected(Value),

    #[error("call ended without a result")]
    Dropped,

    #[error("connection is closed")]
    NotConnected,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("could not encode frame: {0}")]
    Serialization(String),

    #[error("connection was replaced by a newer one")]
    ConnectionReplaced,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Collaborators shared by every connection of one server.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub metrics: Arc<MetricsCollector>,
    /// Receives `execute` broadcasts for persisting plugins.
    pub host: Option<Arc<PluginHost>>,
}

impl ConnectionContext {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            metrics,
            host: None,
        }
    }

    pub fn with_host(mut self, host: Arc<PluginHost>) -> Self {
        self.host = Some(host);
        self
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new(Arc::new(MetricsCollector::with_defaults()))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct PendingRequest {
    reply: oneshot::Sender<Result<Value, CallError>>,
    method: String,
    started_at: Instant,
}

/// One secure device connection.
///
/// Frames are handled in arrival order by the task running
/// [`serve`](Connection::serve). Outbound frames go through an unbounded
/// channel drained by a writer task, so sending never waits on the socket.
pub struct Connection {
    id: ClientId,
    query: ClientQuery,
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<AHashMap<MessageId, PendingRequest>>,
    router: MessageRouter,
    plugins: RwLock<AHashSet<String>>,
    background_plugins: RwLock<Vec<String>>,
    active_plugins: RwLock<AHashSet<String>>,
    outbound: flume::Sender<Bytes>,
    events: EventBus<ClientEvent>,
    cancel: CancellationToken,
    context: ConnectionContext,
}

impl Connection {
    /// Returns the connection and the receiver its writer task drains.
    pub fn new(query: ClientQuery, context: ConnectionContext) -> (Arc<Self>, flume::Receiver<Bytes>) {
        let (outbound, outbound_rx) = flume::unbounded();
        let connection = Arc::new(Self {
            id: query.client_id(),
            query,
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(AHashMap::new()),
            router: MessageRouter::new(),
            plugins: RwLock::new(AHashSet::new()),
            background_plugins: RwLock::new(Vec::new()),
            active_plugins: RwLock::new(AHashSet::new()),
            outbound,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            context,
        });
        (connection, outbound_rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn query(&self) -> &ClientQuery {
        &self.query
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.events
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().expect("connection lock poisoned").len()
    }

    // -- IO -------------------------------------------------------------------

    /// Pump frames until the peer goes away or the connection is closed.
    pub async fn serve<S>(self: Arc<Self>, framed: FramedStream<S>, outbound: flume::Receiver<Bytes>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = framed.split();

        let writer_cancel = self.cancel.clone();
        let writer_id = self.id.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = outbound.recv_async() => {
                        let Ok(frame) = next else { break };
                        if let Err(err) = sink.send(frame).await {
                            warn!(client_id = %writer_id, error = %err, "write failed");
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(bytes)) => self.handle_frame(&bytes),
                    Some(Err(err)) => {
                        warn!(client_id = %self.id, error = %err, "read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.close();
        let _ = writer.await;
    }

    /// Mark the connection closed. Calls still waiting stay unresolved.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(client_id = %self.id, "connection closed");
            self.cancel.cancel();
            self.events.publish(ClientEvent::Closed);
        }
    }

    /// Close and fail every waiting call with [`CallError::ConnectionReplaced`].
    pub fn force_close(&self) {
        self.close();
        let pending: Vec<PendingRequest> = self
            .pending
            .lock()
            .expect("connection lock poisoned")
            .drain()
            .map(|(_, request)| request)
            .collect();
        for request in pending {
            let _ = request.reply.send(Err(CallError::ConnectionReplaced));
        }
    }

    // -- Outbound -------------------------------------------------------------

    pub fn send(&self, method: &str, params: Value) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        let bytes = frame::encode(&SendFrame {
            method,
            params: &params,
        })
        .map_err(|e| CallError::Serialization(e.to_string()))?;
        debug!(client_id = %self.id, method, "send");
        self.outbound
            .send(Bytes::from(bytes))
            .map_err(|_| CallError::NotConnected)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let (_, reply) = self.start_call(method, &params)?;
        reply.await.unwrap_or(Err(CallError::Dropped))
    }

    /// Like [`call`](Connection::call) but gives up after `timeout`, forgetting
    /// the request so a late response is dropped.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let (id, reply) = self.start_call(method, &params)?;
        match tokio::time::timeout(timeout, reply).await {
            Ok(result) => result.unwrap_or(Err(CallError::Dropped)),
            Err(_) => {
                self.pending.lock().expect("connection lock poisoned").remove(&id);
                Err(CallError::Timeout(timeout))
            }
        }
    }

    fn start_call(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<(MessageId, oneshot::Receiver<Result<Value, CallError>>), CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = frame::encode(&CallFrame { id, method, params })
            .map_err(|e| CallError::Serialization(e.to_string()))?;

        let (reply, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("connection lock poisoned");
            if !self.is_connected() {
                return Err(CallError::NotConnected);
            }
            pending.insert(
                id,
                PendingRequest {
                    reply,
                    method: method.to_string(),
                    started_at: Instant::now(),
                },
            );
        }

        if self.outbound.send(Bytes::from(bytes)).is_err() {
            self.pending.lock().expect("connection lock poisoned").remove(&id);
            return Err(CallError::NotConnected);
        }
        debug!(client_id = %self.id, id, method, "call");
        Ok((id, receiver))
    }

    // -- Inbound --------------------------------------------------------------

    /// Handle one raw frame from the device.
    pub fn handle_frame(self: &Arc<Self>, bytes: &[u8]) {
        let inbound = match InboundFrame::decode(bytes) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(client_id = %self.id, error = %err, "dropping malformed frame");
                self.context
                    .metrics
                    .increment_counter(names::FRAMES_DROPPED_TOTAL, &[("reason", "malformed")]);
                return;
            }
        };

        match inbound {
            InboundFrame::Response { id, outcome } => self.resolve(id, outcome),
            InboundFrame::DeviceError { method, error } => self.report_device_error(method, error),
            InboundFrame::Execute(execute) => self.route_execute(execute),
            InboundFrame::RefreshPlugins => {
                let connection = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = connection.refresh_plugins().await {
                        warn!(client_id = %connection.id, error = %err, "refreshing plugins failed");
                    }
                });
            }
            InboundFrame::Other { method } => {
                debug!(client_id = %self.id, ?method, "ignoring frame");
            }
        }
    }

    fn resolve(&self, id: MessageId, outcome: ResponseOutcome) {
        let request = self.pending.lock().expect("connection lock poisoned").remove(&id);
        let Some(request) = request else {
            debug!(client_id = %self.id, id, "response for unknown request");
            return;
        };

        let elapsed = request.started_at.elapsed();
        let metrics = &self.context.metrics;
        metrics.record_histogram(names::REQUEST_RESPONSE_DURATION, elapsed.as_secs_f64());
        metrics.increment_counter(names::CALLS_TOTAL, &[("method", request.method.as_str())]);
        debug!(client_id = %self.id, id, method = %request.method, ?elapsed, "response");

        let result = match outcome {
            ResponseOutcome::Success(value) => Ok(value),
            ResponseOutcome::Error(error) => Err(CallError::Rejected(error)),
            ResponseOutcome::Empty => {
                warn!(client_id = %self.id, id, "response carried neither success nor error");
                Err(CallError::Dropped)
            }
        };
        let _ = request.reply.send(result);
    }

    fn report_device_error(&self, method: Option<String>, err: DeviceError) {
        self.context
            .metrics
            .increment_counter(names::DEVICE_ERRORS_TOTAL, &[]);
        if err.is_crash_report() {
            error!(
                client_id = %self.id,
                ?method,
                name = %err.name,
                message = %err.message,
                stacktrace = %err.stacktrace,
                "device error"
            );
        } else {
            warn!(client_id = %self.id, ?method, "device sent an empty error");
        }
        self.events.publish(ClientEvent::DeviceError(err));
    }

    fn route_execute(&self, execute: ExecuteParams) {
        let ExecuteParams {
            api,
            method,
            params,
        } = execute;

        if let (Some(host), Some(plugin_id)) = (&self.context.host, api.plugin_id()) {
            let persistent = host
                .catalog()
                .get(plugin_id)
                .is_some_and(|plugin| plugin.is_persistent());
            if persistent {
                match host.handle_execute(&self.id, &self.query.device_id, plugin_id, &method, params) {
                    Ok(delivery) => debug!(client_id = %self.id, %api, method = %method, ?delivery, "plugin event"),
                    Err(err) => warn!(client_id = %self.id, %api, method = %method, error = %err, "plugin event rejected"),
                }
                return;
            }
        }

        let report = self.router.dispatch(&api, &method, &params);
        if report.delivered == 0 && report.is_ok() {
            debug!(client_id = %self.id, %api, method = %method, "no subscriber for event");
        }
        for failure in &report.failures {
            warn!(client_id = %self.id, %api, method = %method, error = %failure, "subscriber failed");
        }
    }

    // -- Plugins --------------------------------------------------------------

    /// Negotiate supported plugins and start the background ones.
    pub async fn init(&self) -> Result<(), CallError> {
        self.load_plugins().await?;
        let background = self.load_background_plugins().await?;
        for plugin in &background {
            if self.connects_in_background(plugin) {
                self.init_plugin(plugin)?;
            }
        }
        info!(client_id = %self.id, plugins = ?self.plugins(), "connection initialised");
        Ok(())
    }

    /// Re-read the plugin lists after the device announced a change.
    pub async fn refresh_plugins(&self) -> Result<(), CallError> {
        let previous = self
            .background_plugins
            .read()
            .expect("connection lock poisoned")
            .clone();
        self.load_plugins().await?;
        let current = self.load_background_plugins().await?;

        for plugin in previous.iter().filter(|p| !current.contains(p)) {
            if self.is_plugin_active(plugin) {
                self.deinit_plugin(plugin)?;
            }
        }
        for plugin in current.iter().filter(|p| !previous.contains(p)) {
            if self.connects_in_background(plugin) {
                self.init_plugin(plugin)?;
            }
        }
        self.events.publish(ClientEvent::PluginsChanged);
        Ok(())
    }

    async fn load_plugins(&self) -> Result<(), CallError> {
        let response = self.call(GET_PLUGINS, Value::Null).await?;
        *self.plugins.write().expect("connection lock poisoned") =
            plugin_list(&response).into_iter().collect();
        Ok(())
    }

    async fn load_background_plugins(&self) -> Result<Vec<String>, CallError> {
        let plugins = if self.query.sdk_version() < 4 {
            Vec::new()
        } else {
            plugin_list(&self.call(GET_BACKGROUND_PLUGINS, Value::Null).await?)
        };
        *self.background_plugins.write().expect("connection lock poisoned") = plugins.clone();
        Ok(plugins)
    }

    fn connects_in_background(&self, plugin_id: &str) -> bool {
        self.context.host.as_ref().is_some_and(|host| {
            host.catalog()
                .get(plugin_id)
                .is_some_and(|plugin| plugin.is_persistent())
        })
    }

    /// Supported plugin ids, sorted.
    pub fn plugins(&self) -> Vec<String> {
        let mut plugins: Vec<String> = self
            .plugins
            .read()
            .expect("connection lock poisoned")
            .iter()
            .cloned()
            .collect();
        plugins.sort();
        plugins
    }

    pub fn background_plugins(&self) -> Vec<String> {
        self.background_plugins
            .read()
            .expect("connection lock poisoned")
            .clone()
    }

    pub fn supports_plugin(&self, plugin_id: &str) -> bool {
        self.plugins
            .read()
            .expect("connection lock poisoned")
            .contains(plugin_id)
    }

    /// Ask the device whether `api` implements `method`. Older SDKs and
    /// unsupported plugins answer false without a round trip.
    pub async fn supports_method(&self, api: &str, method: &str) -> Result<bool, CallError> {
        if self.query.sdk_version() < 2 || !self.supports_plugin(api) {
            return Ok(false);
        }
        let response = self
            .call(IS_METHOD_SUPPORTED, json!({ "api": api, "method": method }))
            .await?;
        Ok(response
            .get("isSupported")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub fn init_plugin(&self, plugin_id: &str) -> Result<(), CallError> {
        self.active_plugins
            .write()
            .expect("connection lock poisoned")
            .insert(plugin_id.to_string());
        self.send(INIT, json!({ "plugin": plugin_id }))
    }

    pub fn deinit_plugin(&self, plugin_id: &str) -> Result<(), CallError> {
        self.active_plugins
            .write()
            .expect("connection lock poisoned")
            .remove(plugin_id);
        self.send(DEINIT, json!({ "plugin": plugin_id }))
    }

    pub fn is_plugin_active(&self, plugin_id: &str) -> bool {
        self.active_plugins
            .read()
            .expect("connection lock poisoned")
            .contains(plugin_id)
    }

    pub fn plugin_client(self: &Arc<Self>, api: impl Into<String>) -> PluginClient {
        PluginClient {
            connection: Arc::clone(self),
            api: api.into(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

fn plugin_list(response: &Value) -> Vec<String> {
    response
        .get("plugins")
        .and_then(Value::as_array)
        .map(|plugins| {
            plugins
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn execute_params(api: &str, method: &str, params: Value) -> Value {
    json!({ "api": api, "method": method, "params": params })
}

// ---------------------------------------------------------------------------
// PluginClient
// ---------------------------------------------------------------------------

/// A connection seen through one plugin api.
#[derive(Debug, Clone)]
pub struct PluginClient {
    connection: Arc<Connection>,
    api: String,
}

impl PluginClient {
    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.connection
            .call(EXECUTE, execute_params(&self.api, method, params))
            .await
    }

    pub fn send(&self, method: &str, params: Value) -> Result<(), CallError> {
        self.connection
            .send(EXECUTE, execute_params(&self.api, method, params))
    }

    pub fn subscribe(&self, method: &str, callback: Callback) -> bool {
        self.connection
            .router()
            .subscribe(Api::plugin(self.api.as_str()), method, callback)
    }

    pub fn unsubscribe(&self, method: &str, callback: &Callback) -> bool {
        self.connection
            .router()
            .unsubscribe(&Api::plugin(self.api.as_str()), method, callback)
    }

    pub async fn supports_method(&self, method: &str) -> Result<bool, CallError> {
        self.connection.supports_method(&self.api, method).await
    }
}
