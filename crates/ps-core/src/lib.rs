//! Shared vocabulary for the periscope connection core.
//!
//! - [`types`]: client identity (`ClientQuery`, `ClientId`, `PluginKey`)
//! - [`frame`]: the JSON wire envelope exchanged with devices
//! - [`config`]: TOML configuration loaded from `~/.periscope/config.toml`

pub mod config;
pub mod frame;
pub mod types;
