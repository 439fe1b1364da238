use grundval_config::ConfigError;
use grundval_core::error::{AllocError, PoolError, ThreadError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),

    #[error("Thread pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Report serialization failed: {0}")]
    Report(#[from] serde_yaml::Error),

    #[error("Invalid workload: {0}")]
    InvalidWorkload(String),
}
