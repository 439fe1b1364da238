//! # Grundval Configuration System
//!
//! Hierarchical configuration for the grundval runtime: allocator sizing,
//! worker pool shape and telemetry.
//!
//! ## Features
//! - **Layered sources**: defaults, YAML files, then environment variables
//! - **Validation**: range and cross-field checks before anything is built

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod allocator;
mod error;
mod pool;
mod telemetry;
mod validation;

pub use allocator::AllocatorConfig;
pub use error::ConfigError;
pub use pool::PoolConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/grundval.yaml";
const ENV_PREFIX: &str = "GRUNDVAL_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Root allocator sizing.
    #[validate(nested)]
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Worker pool shape.
    #[validate(nested)]
    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/grundval.yaml`, if present
    /// 3. `config/<GRUNDVAL_ENV>.yaml` (`production` when unset), if present
    /// 4. `GRUNDVAL_*` environment variables, `__` separating sections
    ///    (`GRUNDVAL_POOL__WORKER_THREADS=8`)
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(RuntimeConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        let env = std::env::var("GRUNDVAL_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment)
    }

    /// Load configuration from a specific file (plus environment overrides).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        Self::extract(
            Figment::from(Serialized::defaults(RuntimeConfig::default())).merge(Yaml::file(path)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        let config = RuntimeConfig::default();
        config.validate().expect("Default config should validate");
        assert_eq!(config.pool.worker_threads, num_cpus::get());
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn layered_sources_override_in_order() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/grundval.yaml",
                "pool:\n  worker_threads: 2\n  channel_capacity: 64\n",
            )?;
            jail.create_file("config/staging.yaml", "pool:\n  channel_capacity: 128\n")?;
            jail.set_env("GRUNDVAL_ENV", "staging");
            jail.set_env("GRUNDVAL_TELEMETRY__LOG_LEVEL", "debug");

            let config = RuntimeConfig::load().expect("config should load");
            assert_eq!(config.pool.worker_threads, 2);
            assert_eq!(config.pool.channel_capacity, 128);
            assert_eq!(config.telemetry.log_level, "debug");
            assert_eq!(config.allocator, AllocatorConfig::default());
            Ok(())
        });
    }

    #[test]
    fn environment_override() {
        Jail::expect_with(|jail| {
            jail.set_env("GRUNDVAL_POOL__PIN_WORKERS", "true");
            let config = RuntimeConfig::load().expect("config should load");
            assert!(config.pool.pin_workers);
            Ok(())
        });
    }

    #[test]
    fn rejects_commit_beyond_reserve() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "allocator:\n  reserve_bytes: 1048576\n  initial_commit_bytes: 2097152"
        )
        .unwrap();

        let err = RuntimeConfig::load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("initial_commit_bytes"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = RuntimeConfig::default();
        config.pool.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.telemetry.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.allocator.reserve_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            RuntimeConfig::load_from_path("does/not/exist.yaml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn malformed_file_is_a_parsing_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool:\n  worker_threads: many").unwrap();
        assert!(matches!(
            RuntimeConfig::load_from_path(file.path()),
            Err(ConfigError::Parsing(_))
        ));
    }
}
