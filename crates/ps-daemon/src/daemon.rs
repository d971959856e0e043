use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use ps_bridge::{
    tls, ConnectionContext, ConnectionRegistry, DrainResult, EventBus, FloodGuard, ServerEvent, ShutdownSignal,
    TransportListener,
};
use ps_certs::deployer::LocalDirectoryDeployer;
use ps_certs::signer::OpensslSigner;
use ps_certs::store::CertificateStore;
use ps_certs::CertificateAuthority;
use ps_core::config::Config;
use ps_queue::catalog::PluginCatalog;
use ps_queue::queue::MessageQueue;
use ps_queue::state::PluginStateStore;
use ps_queue::stats::BackgroundStats;
use ps_queue::{FrameIdler, MessageScheduler, PluginHost};
use ps_telemetry::metrics::MetricsCollector;
use tracing::{debug, error, info, warn};

/// How long the accept loops get to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The device connection daemon.
///
/// Owns both endpoints, the connection registry and the plugin host.
/// Shuts down when the [`ShutdownSignal`] is triggered (e.g. via ctrl-c).
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    metrics: Arc<MetricsCollector>,
    events: EventBus<ServerEvent>,
    host: Arc<PluginHost>,
    registry: Arc<ConnectionRegistry>,
    listener: Arc<TransportListener>,
}

impl Daemon {
    /// Create a daemon backed by the on-disk CA in `config.certs.dir`,
    /// generating the CA and server certificate when missing or stale.
    pub async fn new(config: Config) -> Result<Self> {
        let dir = config.certs.dir_path();
        let signer = OpensslSigner::new(&config.certs.openssl, &dir);
        signer
            .ensure_server_certificates()
            .await
            .with_context(|| format!("failed to prepare server certificates in {}", dir.display()))?;

        let paths = signer.paths().clone();
        let tls_config = tls::build_server_config(&paths.server_cert(), &paths.server_key(), &paths.ca_cert())
            .context("failed to load the server TLS identity")?;
        let store = CertificateStore::open(paths.records())
            .await
            .context("failed to open the certificate records")?;

        let authority = CertificateAuthority::new(Arc::new(signer), Arc::new(store))
            .with_deployer(Arc::new(LocalDirectoryDeployer::new()))
            .require_known_device(config.certs.require_known_device);
        Ok(Self::with_parts(config, Arc::new(authority), tls_config))
    }

    /// Assemble a daemon around a prepared authority and TLS identity.
    pub fn with_parts(
        config: Config,
        authority: Arc<CertificateAuthority>,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::with_defaults());

        let stats = BackgroundStats::new(Duration::from_millis(config.queue.reducer_budget_ms))
            .with_metrics(Arc::clone(&metrics));
        let scheduler = Arc::new(MessageScheduler::new(
            Arc::new(MessageQueue::new(config.queue.warn_threshold)),
            Arc::new(PluginStateStore::new()),
            Arc::new(stats),
        ));
        let host = Arc::new(PluginHost::new(Arc::new(PluginCatalog::new()), scheduler));

        let events = EventBus::new();
        let registry = Arc::new(
            ConnectionRegistry::new(events.clone(), Arc::clone(&metrics)).with_host(Arc::clone(&host)),
        );
        let flood = Arc::new(FloodGuard::from_config(&config.flood).with_metrics(Arc::clone(&metrics)));
        let context = ConnectionContext::new(Arc::clone(&metrics)).with_host(Arc::clone(&host));
        let listener = Arc::new(TransportListener::new(
            config.server.clone(),
            authority,
            Arc::clone(&registry),
            flood,
            context,
            tls_config,
        ));

        Self {
            config,
            shutdown: ShutdownSignal::new(),
            metrics,
            events,
            host,
            registry,
            listener,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    /// Plugins registered here receive queued `execute` events.
    pub fn host(&self) -> &Arc<PluginHost> {
        &self.host
    }

    /// Idler for draining a selected plugin, paced by `queue.idle_interval_ms`.
    pub fn frame_idler(&self) -> FrameIdler {
        FrameIdler::new(Duration::from_millis(self.config.queue.idle_interval_ms))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Serve both endpoints until shutdown (blocking).
    ///
    /// Fails only when neither endpoint could be started.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let events = tokio::spawn(log_server_events(self.events.subscribe(), shutdown.clone()));
        let mut handles = self.listener.start(&shutdown);
        let expected = handles.len();
        info!(
            insecure = %self.config.server.insecure_addr(),
            secure = %self.config.server.secure_addr(),
            "daemon starting"
        );

        let endpoints_failed = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = join_all(handles.iter_mut()) => !shutdown.is_shutting_down(),
        };
        if endpoints_failed {
            shutdown.trigger();
            let _ = events.await;
            bail!("no endpoint could be started");
        }

        info!("shutdown signal received, stopping endpoints");
        match shutdown.wait_for_drain(expected, DRAIN_TIMEOUT).await {
            DrainResult::Complete(count) => debug!(count, "endpoints stopped"),
            DrainResult::Timeout { confirmed, expected } => {
                warn!(confirmed, expected, "endpoints did not stop in time, aborting");
                for handle in &handles {
                    handle.abort();
                }
            }
        }

        self.registry.close_all();
        let _ = events.await;
        info!(metrics = %self.metrics.export_json(), "daemon stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("listener", &self.listener)
            .field("clients", &self.registry.len())
            .finish()
    }
}

async fn log_server_events(events: flume::Receiver<ServerEvent>, shutdown: ShutdownSignal) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => log_server_event(&event),
                Err(_) => break,
            },
        }
    }
}

fn log_server_event(event: &ServerEvent) {
    match event {
        ServerEvent::Listening { endpoint, addr } => info!(%endpoint, %addr, "endpoint ready"),
        ServerEvent::NewClient(connection) => info!(
            client_id = %connection.id(),
            plugins = ?connection.plugins(),
            "client ready"
        ),
        ServerEvent::RemovedClient(id) => info!(client_id = %id, "client removed"),
        ServerEvent::ClientsChange => {}
        ServerEvent::StartClientSetup(client) => info!(
            app = %client.app_name,
            os = %client.os,
            device = %client.device_name,
            "client setup started"
        ),
        ServerEvent::FinishClientSetup { client, device_id } => info!(
            app = %client.app_name,
            %device_id,
            "client setup finished"
        ),
        ServerEvent::ClientSetupError { client, error } => warn!(
            app = %client.app_name,
            %error,
            "client setup failed"
        ),
        ServerEvent::Error(message) => error!(%message, "server error"),
    }
}
