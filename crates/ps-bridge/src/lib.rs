//! Transport and routing layer between devices and the desktop.
//!
//! Devices bootstrap on a plain TCP endpoint by exchanging a CSR for a
//! signed certificate, then reconnect over mutual TLS where each socket
//! becomes a [`Connection`](connection::Connection).
//!
//! Key modules:
//! - [`listener`]: the two accept loops and per-socket handlers
//! - [`connection`]: RPC over one secure socket
//! - [`registry`]: live connections and lifecycle events
//! - [`router`]: `(api, method)` subscriptions
//! - [`flood_guard`]: reconnect loop detection
//! - [`event_bus`]: typed fan-out used for lifecycle events

pub mod codec;
pub mod connection;
pub mod event_bus;
pub mod events;
pub mod flood_guard;
pub mod listener;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod tls;

pub use connection::{CallError, Connection, ConnectionContext, PluginClient};
pub use event_bus::EventBus;
pub use events::{ClientEvent, Endpoint, ServerEvent};
pub use flood_guard::{FloodGuard, FloodStatus};
pub use listener::{ListenerError, TransportListener};
pub use registry::ConnectionRegistry;
pub use router::{Callback, DispatchReport, MessageRouter};
pub use shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
