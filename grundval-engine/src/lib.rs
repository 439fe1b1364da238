//! # grundval-engine
//!
//! Turns a validated [`RuntimeConfig`](grundval_config::RuntimeConfig) into a
//! running [`Runtime`] (root allocators, worker pool, metrics) and hosts the
//! built-in workloads the CLI exposes.

pub mod error;
pub mod runtime;
pub mod workloads;

pub use error::EngineError;
pub use runtime::Runtime;
pub use workloads::{
    render_yaml, AllocProbeReport, ChannelKind, ChannelReport, PoolReport, StressOptions,
    TopologyReport,
};
