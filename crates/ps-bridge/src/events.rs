use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ps_core::frame::DeviceError;
use ps_core::types::{ClientId, UninitializedClient};

use crate::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Plain TCP, certificate exchange only.
    Insecure,
    /// Mutual TLS, full RPC.
    Secure,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Insecure => write!(f, "insecure"),
            Endpoint::Secure => write!(f, "secure"),
        }
    }
}

/// Server lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        endpoint: Endpoint,
        addr: SocketAddr,
    },
    NewClient(Arc<Connection>),
    RemovedClient(ClientId),
    ClientsChange,
    StartClientSetup(UninitializedClient),
    FinishClientSetup {
        client: UninitializedClient,
        device_id: String,
    },
    ClientSetupError {
        client: UninitializedClient,
        error: String,
    },
    Error(String),
}

/// Notifications scoped to one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PluginsChanged,
    DeviceError(DeviceError),
    Closed,
}
