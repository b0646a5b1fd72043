//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing` events rendered as JSON/pretty/compact
//! - **Metrics**: counters and histograms for job throughput, exported to Prometheus

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::init_metrics;
