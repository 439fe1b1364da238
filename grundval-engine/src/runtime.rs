//! Runtime bootstrap: root allocators, worker pool and metrics built from config.
use std::sync::Arc;

use tracing::{debug, info, instrument};

use grundval_config::RuntimeConfig;
use grundval_core::alloc::{install_root_allocators, AllocatorRef, LinearAllocator, MallocAllocator};
use grundval_core::thread::{PoolOptions, ThreadPool};
use grundval_telemetry::MetricsRecorder;

use crate::error::EngineError;

/// A bootstrapped runtime bound to the thread that created it.
///
/// The creating thread becomes a root owner: the heap is its default
/// allocator and a fixed-size arena its scratch allocator. A thread can only
/// bootstrap once.
pub struct Runtime {
    config: RuntimeConfig,
    heap: AllocatorRef,
    pub(crate) scratch: Arc<LinearAllocator>,
    pub(crate) pool: ThreadPool,
    metrics: Option<MetricsRecorder>,
}

impl Runtime {
    #[instrument(level = "info", name = "bootstrap_runtime", skip(config))]
    pub fn bootstrap(config: RuntimeConfig) -> Result<Self, EngineError> {
        debug!("Runtime config: {:?}", config);

        let heap: AllocatorRef = Arc::new(MallocAllocator);
        let scratch =
            Arc::new(LinearAllocator::new(config.allocator.scratch_bytes)?.with_name("scratch"));

        let pool = ThreadPool::new(
            PoolOptions {
                threads: config.pool.worker_threads,
                channel_capacity: config.pool.channel_capacity,
                pin_workers: config.pool.pin_workers,
            },
            &heap,
        )?;

        let metrics = if config.telemetry.metrics {
            Some(MetricsRecorder::new()?)
        } else {
            None
        };

        // Last fallible step: a failed bootstrap leaves the thread without roots.
        install_root_allocators(heap.clone(), scratch.clone())?;

        info!(
            workers = pool.threads(),
            scratch_bytes = scratch.capacity(),
            metrics = metrics.is_some(),
            "Runtime ready"
        );

        Ok(Self {
            config,
            heap,
            scratch,
            pool,
            metrics,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The thread-safe heap shared by workers, channels and tasks.
    pub fn heap(&self) -> &AllocatorRef {
        &self.heap
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn metrics(&self) -> Option<&MetricsRecorder> {
        self.metrics.as_ref()
    }

    /// Prometheus text for everything recorded so far, if metrics are enabled.
    pub fn gather_metrics(&self) -> Result<Option<String>, EngineError> {
        Ok(self
            .metrics
            .as_ref()
            .map(MetricsRecorder::gather_metrics)
            .transpose()?)
    }

    /// Closes the pool, running any queued tasks first.
    pub fn shutdown(self) {
        self.pool.close();
        info!(
            tasks_executed = self.pool.tasks_executed(),
            "Runtime shut down"
        );
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.pool)
            .field("scratch_used", &self.scratch.used())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use grundval_core::alloc::{default_allocator, scratch_allocator};
    use grundval_core::error::{AllocError, PoolError};

    /// Small sizes so tests stay cheap.
    pub(crate) fn test_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.allocator.reserve_bytes = 16 * 1024 * 1024;
        config.allocator.initial_commit_bytes = 1024 * 1024;
        config.allocator.commit_step_bytes = 1024 * 1024;
        config.allocator.scratch_bytes = 64 * 1024;
        config.pool.worker_threads = 2;
        config.pool.channel_capacity = 64;
        config
    }

    /// Root allocators are per thread, so every runtime gets a fresh one.
    pub(crate) fn with_runtime<R, F>(config: RuntimeConfig, f: F) -> R
    where
        F: FnOnce(&Runtime) -> R + Send + 'static,
        R: Send + 'static,
    {
        std::thread::spawn(move || {
            let runtime = Runtime::bootstrap(config).expect("runtime should bootstrap");
            let result = f(&runtime);
            runtime.shutdown();
            result
        })
        .join()
        .expect("runtime thread panicked")
    }

    #[test]
    fn bootstrap_installs_root_allocators() {
        let names = with_runtime(test_config(), |runtime| {
            assert_eq!(runtime.pool().threads(), 2);
            (
                default_allocator().unwrap().name().to_owned(),
                scratch_allocator().unwrap().name().to_owned(),
            )
        });
        assert_eq!(names, ("malloc".to_owned(), "scratch".to_owned()));
    }

    #[test]
    fn second_bootstrap_on_the_same_thread_fails() {
        let outcome = with_runtime(test_config(), |_| {
            matches!(
                Runtime::bootstrap(test_config()),
                Err(EngineError::Alloc(AllocError::InvalidArgument(_)))
            )
        });
        assert!(outcome);
    }

    #[test]
    fn failed_bootstrap_leaves_no_roots_behind() {
        let outcome = std::thread::spawn(|| {
            let mut broken = test_config();
            broken.pool.worker_threads = 0;
            let first = Runtime::bootstrap(broken);
            assert!(matches!(
                first,
                Err(EngineError::Pool(PoolError::Alloc(AllocError::InvalidArgument(_))))
            ));
            assert!(matches!(
                default_allocator(),
                Err(AllocError::NotInitialized("default"))
            ));

            let runtime = Runtime::bootstrap(test_config()).expect("retry should bootstrap");
            let name = default_allocator().unwrap().name().to_owned();
            runtime.shutdown();
            name
        })
        .join()
        .unwrap();
        assert_eq!(outcome, "malloc");
    }

    #[test]
    fn metrics_follow_the_telemetry_switch() {
        let mut config = test_config();
        config.telemetry.metrics = false;
        let disabled = with_runtime(config, |runtime| runtime.gather_metrics().unwrap());
        assert!(disabled.is_none());

        let enabled = with_runtime(test_config(), |runtime| runtime.gather_metrics().unwrap());
        assert!(enabled.unwrap().contains("grundval_tasks_total"));
    }
}
