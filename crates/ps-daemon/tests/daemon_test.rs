//! Daemon integration tests: both endpoints on ephemeral ports, a device
//! bootstrapping and reconnecting over mutual TLS, queued plugin events,
//! and shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ps_bridge::codec::{self, FramedStream};
use ps_bridge::{tls, Endpoint, ServerEvent};
use ps_certs::authority::{DeviceIdRequest, DeviceIdResolver};
use ps_certs::deployer::{LocalDirectoryDeployer, DEVICE_CA_CERT_FILE, DEVICE_CLIENT_CERT_FILE};
use ps_certs::signer::SigningBackend;
use ps_certs::store::CertificateStore;
use ps_certs::CertificateAuthority;
use ps_core::config::{Config, ServerConfig};
use ps_core::types::ClientQuery;
use ps_daemon::daemon::Daemon;
use ps_queue::{DrainOutcome, FnReducer, PluginDefinition};
use ps_telemetry::metrics::names;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const CA_CERT: &str = include_str!("../../ps-certs/tests/fixtures/ca.crt");
const DEVICE_CERT: &str = include_str!("../../ps-certs/tests/fixtures/device.crt");
const DEVICE_CSR: &str = include_str!("../../ps-certs/tests/fixtures/device.csr");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct FixtureSigner;

#[async_trait]
impl SigningBackend for FixtureSigner {
    async fn sign(&self, _csr: &str) -> ps_certs::Result<String> {
        Ok(DEVICE_CERT.to_string())
    }

    async fn ca_certificate(&self) -> ps_certs::Result<String> {
        Ok(CA_CERT.to_string())
    }
}

struct FixedId;

#[async_trait]
impl DeviceIdResolver for FixedId {
    async fn resolve(&self, _request: &DeviceIdRequest<'_>) -> ps_certs::Result<String> {
        Ok("D1".to_string())
    }
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../ps-certs/tests/fixtures")
        .join(name)
}

fn authority() -> CertificateAuthority {
    CertificateAuthority::new(Arc::new(FixtureSigner), Arc::new(CertificateStore::in_memory()))
        .with_resolver(Arc::new(FixedId))
}

fn daemon(server: ServerConfig) -> Arc<Daemon> {
    daemon_with(server, authority())
}

fn daemon_with(server: ServerConfig, authority: CertificateAuthority) -> Arc<Daemon> {
    let config = Config {
        server,
        ..Config::default()
    };
    let tls_config =
        tls::build_server_config(&fixture("server.crt"), &fixture("server.key"), &fixture("ca.crt")).unwrap();
    Arc::new(Daemon::with_parts(config, Arc::new(authority), tls_config))
}

fn ephemeral_ports() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        insecure_port: 0,
        secure_port: 0,
        init_timeout_secs: 5,
        ..ServerConfig::default()
    }
}

async fn send<S: AsyncRead + AsyncWrite + Unpin>(framed: &mut FramedStream<S>, frame: Value) {
    framed
        .send(Bytes::from(serde_json::to_vec(&frame).unwrap()))
        .await
        .unwrap();
}

async fn receive<S: AsyncRead + AsyncWrite + Unpin>(framed: &mut FramedStream<S>) -> Value {
    let bytes = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for(events: &flume::Receiver<ServerEvent>, want: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv_async().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition in time")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn device_bootstraps_connects_and_queues_plugin_events() {
    let sandbox = tempfile::tempdir().unwrap();
    let daemon = daemon_with(
        ephemeral_ports(),
        authority().with_deployer(Arc::new(LocalDirectoryDeployer::rooted_at(sandbox.path()))),
    );
    daemon.host().catalog().register(PluginDefinition::client("Network").with_reducer(Arc::new(
        FnReducer::new(json!({"requests": 0}), |state: &Value, _method: &str, _params: &Value| {
            Ok(json!({"requests": state["requests"].as_i64().unwrap_or(0) + 1}))
        }),
    )));
    let events = daemon.events().subscribe();
    let running = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move { daemon.run().await }
    });

    let mut insecure = None;
    let mut secure = None;
    while insecure.is_none() || secure.is_none() {
        if let ServerEvent::Listening { endpoint, addr } =
            wait_for(&events, |e| matches!(e, ServerEvent::Listening { .. })).await
        {
            match endpoint {
                Endpoint::Insecure => insecure = Some(addr),
                Endpoint::Secure => secure = Some(addr),
            }
        }
    }
    let (insecure, secure): (SocketAddr, SocketAddr) = (insecure.unwrap(), secure.unwrap());

    // Certificate exchange.
    let mut bootstrap = codec::framed(TcpStream::connect(insecure).await.unwrap(), 1 << 20);
    let pending = ClientQuery::new("Example", "Android", "Pixel", "unknown").with_sdk_version(4);
    send(&mut bootstrap, serde_json::to_value(&pending).unwrap()).await;
    send(
        &mut bootstrap,
        json!({"method": "signCertificate", "csr": DEVICE_CSR, "destination": "periscope"}),
    )
    .await;
    assert_eq!(receive(&mut bootstrap).await, json!({"deviceId": "D1"}));
    drop(bootstrap);
    let deployed = sandbox.path().join("periscope");
    assert_eq!(std::fs::read_to_string(deployed.join(DEVICE_CA_CERT_FILE)).unwrap(), CA_CERT);
    assert_eq!(std::fs::read_to_string(deployed.join(DEVICE_CLIENT_CERT_FILE)).unwrap(), DEVICE_CERT);

    // Secure reconnect.
    let client_config =
        tls::build_client_config(&fixture("ca.crt"), &fixture("device.crt"), &fixture("device.key")).unwrap();
    let stream = TlsConnector::from(client_config)
        .connect(
            tls::server_name("localhost").unwrap(),
            TcpStream::connect(secure).await.unwrap(),
        )
        .await
        .unwrap();
    let mut device = codec::framed(stream, 1 << 20);
    let query = ClientQuery::new("Example", "Android", "Pixel", "D1").with_sdk_version(4);
    send(&mut device, serde_json::to_value(&query).unwrap()).await;

    let request = receive(&mut device).await;
    assert_eq!(request["method"], "getPlugins");
    send(&mut device, json!({"id": request["id"], "success": {"plugins": ["Network"]}})).await;
    let request = receive(&mut device).await;
    assert_eq!(request["method"], "getBackgroundPlugins");
    send(&mut device, json!({"id": request["id"], "success": {"plugins": ["Network"]}})).await;
    assert_eq!(
        receive(&mut device).await,
        json!({"method": "init", "params": {"plugin": "Network"}})
    );

    let ServerEvent::NewClient(conn) = wait_for(&events, |e| matches!(e, ServerEvent::NewClient(_))).await else {
        unreachable!()
    };
    assert_eq!(conn.id(), &query.client_id());
    assert_eq!(daemon.metrics().get_gauge(names::CONNECTED_CLIENTS), 1);

    // Nothing is selected, so events queue up.
    for n in 0..3 {
        send(
            &mut device,
            json!({"method": "execute", "params": {"api": "Network", "method": "request", "params": {"n": n}}}),
        )
        .await;
    }
    let host = Arc::clone(daemon.host());
    let key = host.plugin_key(conn.id(), "D1", "Network").unwrap();
    eventually(|| host.scheduler().queue().len(&key) == 3).await;

    let outcome = host
        .select_plugin("Network", key.clone(), &daemon.frame_idler(), None)
        .await
        .unwrap();
    assert_eq!(outcome, DrainOutcome::Completed { applied: 3 });
    assert_eq!(
        *host.scheduler().states().get(&key).unwrap(),
        json!({"requests": 3})
    );

    daemon.shutdown();
    running.await.unwrap().unwrap();
    wait_for(&events, |e| matches!(e, ServerEvent::RemovedClient(_))).await;
    assert!(daemon.registry().is_empty());
    assert_eq!(daemon.metrics().get_gauge(names::CONNECTED_CLIENTS), 0);
}

#[tokio::test]
async fn run_fails_when_no_endpoint_can_bind() {
    let taken_insecure = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken_secure = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let daemon = daemon(ServerConfig {
        insecure_port: taken_insecure.local_addr().unwrap().port(),
        secure_port: taken_secure.local_addr().unwrap().port(),
        ..ephemeral_ports()
    });

    let result = tokio::time::timeout(Duration::from_secs(5), daemon.run())
        .await
        .expect("run returns");
    assert!(result.is_err());
}

#[tokio::test]
async fn shutdown_before_any_client_is_clean() {
    let daemon = daemon(ephemeral_ports());
    let events = daemon.events().subscribe();
    let running = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move { daemon.run().await }
    });
    wait_for(&events, |e| matches!(e, ServerEvent::Listening { .. })).await;

    daemon.shutdown_handle().trigger();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("daemon stops")
        .unwrap()
        .unwrap();
}
