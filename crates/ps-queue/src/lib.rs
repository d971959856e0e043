//! Deferred delivery of plugin events.
//!
//! Events for a plugin that is not on screen are buffered per
//! [`PluginKey`](ps_core::types::PluginKey) and folded into the plugin's
//! persisted state later, a slice at a time, so a burst of events never
//! monopolises the runtime.
//!
//! - [`plugin`]: plugin definitions and the reducer capability
//! - [`catalog`]: registered plugin definitions by id
//! - [`queue`]: per-key FIFO of pending messages
//! - [`state`]: persisted plugin state
//! - [`stats`]: reducer timing diagnostics
//! - [`idler`]: cooperative yield and cancellation
//! - [`scheduler`]: live/queued delivery and draining
//! - [`host`]: entry point used by connections

pub mod catalog;
pub mod host;
pub mod idler;
pub mod plugin;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod stats;

pub use host::{HostDelivery, PluginHost};
pub use idler::{FrameIdler, Idler, ManualIdler};
pub use plugin::{FnReducer, PersistedStateReducer, PluginDefinition, ReducerError};
pub use scheduler::{Delivery, DrainError, DrainOutcome, DrainProgress, MessageScheduler};
