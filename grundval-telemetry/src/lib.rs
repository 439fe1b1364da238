//! # Grundval Telemetry
//!
//! Crate for logging bootstrap and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::init as init_logging;
pub use metrics::MetricsRecorder;
