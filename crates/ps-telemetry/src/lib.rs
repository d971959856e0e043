//! Observability for periscope services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus and JSON
//!   export. Collectors are created by the daemon and handed to the
//!   components that record into them.

pub mod logging;
pub mod metrics;
