//! Device connection daemon.
//!
//! Wires configuration, the local certificate authority, the plugin host and
//! both transport endpoints together and runs them until shutdown.

pub mod daemon;
