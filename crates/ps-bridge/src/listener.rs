use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ps_certs::{CertificateAuthority, PeerIdentity};
use ps_core::config::ServerConfig;
use ps_core::frame::{self, BootstrapRequest, BootstrapResponse};
use ps_core::types::ClientQuery;
use ps_telemetry::metrics::names;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::codec::{self, FramedStream};
use crate::connection::{Connection, ConnectionContext};
use crate::event_bus::EventBus;
use crate::events::{Endpoint, ServerEvent};
use crate::flood_guard::FloodGuard;
use crate::registry::ConnectionRegistry;
use crate::shutdown::{ShutdownGuard, ShutdownSignal};
use crate::tls;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("cannot bind {endpoint} endpoint on {addr}: {source}")]
    Bind {
        endpoint: Endpoint,
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Accepts devices on the insecure and the secure endpoint.
pub struct TransportListener {
    config: ServerConfig,
    authority: Arc<CertificateAuthority>,
    registry: Arc<ConnectionRegistry>,
    flood: Arc<FloodGuard>,
    context: ConnectionContext,
    acceptor: TlsAcceptor,
    events: EventBus<ServerEvent>,
}

impl TransportListener {
    pub fn new(
        config: ServerConfig,
        authority: Arc<CertificateAuthority>,
        registry: Arc<ConnectionRegistry>,
        flood: Arc<FloodGuard>,
        context: ConnectionContext,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Self {
        let events = registry.events().clone();
        Self {
            config,
            authority,
            registry,
            flood,
            context,
            acceptor: TlsAcceptor::from(tls_config),
            events,
        }
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Spawn both accept loops. A loop that cannot bind reports
    /// [`ServerEvent::Error`] and exits without affecting the other one.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_insecure(shutdown.clone(), ShutdownGuard::new(shutdown))),
            tokio::spawn(Arc::clone(self).run_secure(shutdown.clone(), ShutdownGuard::new(shutdown))),
        ]
    }

    async fn bind(&self, endpoint: Endpoint, addr: String) -> Option<TcpListener> {
        match TcpListener::bind(addr.as_str()).await {
            Ok(listener) => {
                match listener.local_addr() {
                    Ok(local) => {
                        info!(%endpoint, addr = %local, "listening");
                        self.events.publish(ServerEvent::Listening {
                            endpoint,
                            addr: local,
                        });
                    }
                    Err(err) => warn!(%endpoint, error = %err, "bound address unavailable"),
                }
                Some(listener)
            }
            Err(source) => {
                let err = ListenerError::Bind {
                    endpoint,
                    addr,
                    source,
                };
                error!(error = %err, "endpoint not started");
                self.events.publish(ServerEvent::Error(err.to_string()));
                None
            }
        }
    }

    async fn run_insecure(self: Arc<Self>, shutdown: ShutdownSignal, _guard: ShutdownGuard) {
        let Some(listener) = self.bind(Endpoint::Insecure, self.config.insecure_addr()).await else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle_insecure(stream, peer).await });
                    }
                    Err(err) => warn!(endpoint = %Endpoint::Insecure, error = %err, "accept failed"),
                },
            }
        }
        info!(endpoint = %Endpoint::Insecure, "endpoint stopped");
    }

    async fn run_secure(self: Arc<Self>, shutdown: ShutdownSignal, _guard: ShutdownGuard) {
        let Some(listener) = self.bind(Endpoint::Secure, self.config.secure_addr()).await else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle_tls(stream, peer).await });
                    }
                    Err(err) => warn!(endpoint = %Endpoint::Secure, error = %err, "accept failed"),
                },
            }
        }
        info!(endpoint = %Endpoint::Secure, "endpoint stopped");
    }

    // -- Insecure -------------------------------------------------------------

    /// Serve one bootstrap socket: a client query, then certificate requests.
    pub async fn handle_insecure<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = codec::framed(stream, self.config.max_frame_bytes);
        let Some(query) = self.read_client_query(&mut framed, Endpoint::Insecure, peer).await else {
            return;
        };
        self.flood.record_attempt(&query);
        let client = query.uninitialized();
        self.events.publish(ServerEvent::StartClientSetup(client.clone()));
        // An attempt is open from StartClientSetup until its single outcome.
        let mut attempt_open = true;

        while let Some(next) = framed.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(%peer, error = %err, "bootstrap read failed");
                    break;
                }
            };

            let (csr, destination) = match BootstrapRequest::decode(&bytes) {
                Ok(BootstrapRequest::SignCertificate { csr, destination }) => (csr, destination),
                Ok(BootstrapRequest::Unsupported { method }) => {
                    debug!(%peer, ?method, "ignoring frame on insecure endpoint");
                    continue;
                }
                Err(err) => {
                    warn!(%peer, error = %err, "dropping malformed bootstrap frame");
                    self.context
                        .metrics
                        .increment_counter(names::FRAMES_DROPPED_TOTAL, &[("reason", "malformed")]);
                    continue;
                }
            };

            if !attempt_open {
                self.events.publish(ServerEvent::StartClientSetup(client.clone()));
            }
            attempt_open = false;
            let response = match self
                .authority
                .sign_certificate_signing_request(&csr, &query.os, &destination)
                .await
            {
                Ok(signed) => {
                    self.record_bootstrap("signed");
                    self.events.publish(ServerEvent::FinishClientSetup {
                        client: client.clone(),
                        device_id: signed.device_id.clone(),
                    });
                    BootstrapResponse::Signed {
                        device_id: signed.device_id,
                    }
                }
                Err(err) => {
                    warn!(app = %query.app, os = %query.os, error = %err, "certificate request failed");
                    self.record_bootstrap("failed");
                    self.events.publish(ServerEvent::ClientSetupError {
                        client: client.clone(),
                        error: err.to_string(),
                    });
                    BootstrapResponse::failed(err.to_string())
                }
            };

            let bytes = match frame::encode(&response) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(error = %err, "encoding bootstrap response");
                    continue;
                }
            };
            if let Err(err) = framed.send(Bytes::from(bytes)).await {
                debug!(%peer, error = %err, "bootstrap peer went away");
                break;
            }
        }

        if attempt_open {
            debug!(%peer, app = %query.app, "bootstrap socket closed before signCertificate");
            self.record_bootstrap("abandoned");
            self.events.publish(ServerEvent::ClientSetupError {
                client,
                error: "connection closed before signCertificate".to_string(),
            });
        }
    }

    fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.config.init_timeout_secs)
    }

    fn record_bootstrap(&self, outcome: &str) {
        self.context
            .metrics
            .increment_counter(names::BOOTSTRAP_TOTAL, &[("outcome", outcome)]);
    }

    // -- Secure ---------------------------------------------------------------

    /// Complete the TLS handshake within the init timeout, then serve the
    /// socket as [`handle_secure`](Self::handle_secure) does.
    pub async fn handle_tls<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let timeout = self.init_timeout();
        match tokio::time::timeout(timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(stream)) => {
                let identity = tls::peer_identity(&stream);
                self.handle_secure(stream, peer, identity).await;
            }
            Ok(Err(err)) => warn!(%peer, error = %err, "TLS handshake failed"),
            Err(_) => warn!(%peer, ?timeout, "TLS handshake timed out"),
        }
    }

    /// Serve one authenticated socket until it closes. `identity` comes from
    /// the TLS handshake.
    pub async fn handle_secure<S>(&self, stream: S, peer: SocketAddr, identity: Option<PeerIdentity>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = codec::framed(stream, self.config.max_frame_bytes);
        let Some(query) = self.read_client_query(&mut framed, Endpoint::Secure, peer).await else {
            return;
        };
        self.flood.record_attempt(&query);

        if let Err(err) = self.authority.validate_secure_peer(&query, identity.as_ref()) {
            warn!(client_id = %query.client_id(), %peer, error = %err, "secure connection refused");
            self.events
                .publish(ServerEvent::Error(format!("{}: {err}", query.client_id())));
            return;
        }

        let (connection, outbound) = Connection::new(query, self.context.clone());
        let serving = tokio::spawn(Arc::clone(&connection).serve(framed, outbound));

        let timeout = self.init_timeout();
        let initialised = match tokio::time::timeout(timeout, connection.init()).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("no plugin list within {timeout:?}")),
        };
        if let Err(reason) = initialised {
            error!(client_id = %connection.id(), reason = %reason, "failed to initialise client");
            self.events.publish(ServerEvent::Error(format!(
                "initialising {}: {reason}",
                connection.id()
            )));
            connection.close();
            let _ = serving.await;
            return;
        }

        self.registry.register(Arc::clone(&connection));
        let _ = serving.await;
        self.registry.remove(&connection);
    }

    async fn read_client_query<S>(
        &self,
        framed: &mut FramedStream<S>,
        endpoint: Endpoint,
        peer: SocketAddr,
    ) -> Option<ClientQuery>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.init_timeout();
        let Ok(first) = tokio::time::timeout(timeout, framed.next()).await else {
            warn!(%endpoint, %peer, ?timeout, "no client query in time");
            return None;
        };
        match first {
            Some(Ok(bytes)) => match frame::decode_client_query(&bytes) {
                Ok(query) => {
                    info!(%endpoint, %peer, client_id = %query.client_id(), "client connected to endpoint");
                    Some(query)
                }
                Err(err) => {
                    warn!(%endpoint, %peer, error = %err, "invalid client query");
                    self.context
                        .metrics
                        .increment_counter(names::FRAMES_DROPPED_TOTAL, &[("reason", "malformed_query")]);
                    None
                }
            },
            Some(Err(err)) => {
                warn!(%endpoint, %peer, error = %err, "read failed before client query");
                None
            }
            None => {
                debug!(%endpoint, %peer, "closed before client query");
                None
            }
        }
    }
}

impl std::fmt::Debug for TransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportListener")
            .field("insecure", &self.config.insecure_addr())
            .field("secure", &self.config.secure_addr())
            .finish()
    }
}
