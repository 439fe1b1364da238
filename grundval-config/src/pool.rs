//! Worker pool sizing.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads; defaults to the logical core count.
    #[serde(default = "default_worker_threads")]
    #[validate(range(min = 1, max = 1024))]
    pub worker_threads: usize,

    /// Requested task queue capacity (rounded up to a power of two).
    #[serde(default = "default_channel_capacity")]
    #[validate(range(min = 1, max = 1048576))]
    pub channel_capacity: usize,

    /// Pin each worker to one core of the process affinity set.
    #[serde(default)]
    pub pin_workers: bool,
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            channel_capacity: default_channel_capacity(),
            pin_workers: false,
        }
    }
}
