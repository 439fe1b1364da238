//! Root allocator sizing.
//!
//! - `reserve_bytes`/`initial_commit_bytes`/`commit_step_bytes` size the
//!   reserve/commit allocator used by the allocation probe
//! - `scratch_bytes` sizes the per-runtime scratch arena

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
#[validate(schema(function = validation::validate_commit_window))]
pub struct AllocatorConfig {
    /// Virtual address space reserved up front.
    #[serde(default = "default_reserve")]
    pub reserve_bytes: usize,

    /// Bytes made usable at construction.
    #[serde(default = "default_initial_commit")]
    pub initial_commit_bytes: usize,

    /// Minimum growth when the committed range runs out.
    #[serde(default = "default_commit_step")]
    #[validate(range(min = 4096))]
    pub commit_step_bytes: usize,

    /// Capacity of the scratch arena.
    #[serde(default = "default_scratch")]
    #[validate(range(min = 1024, max = 1073741824))]
    pub scratch_bytes: usize,
}

fn default_reserve() -> usize {
    1024 * MIB
}

fn default_initial_commit() -> usize {
    64 * MIB
}

fn default_commit_step() -> usize {
    64 * MIB
}

fn default_scratch() -> usize {
    16 * MIB
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: default_reserve(),
            initial_commit_bytes: default_initial_commit(),
            commit_step_bytes: default_commit_step(),
            scratch_bytes: default_scratch(),
        }
    }
}
