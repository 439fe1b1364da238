//! Built-in workloads exercising the allocators, channels and pool.
//!
//! Every workload returns a serializable report; [`render_yaml`] turns it
//! into the text the CLI prints.
use std::alloc::Layout;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use grundval_core::alloc::{Allocator, AllocatorRef, AllocatorStats, SystemMemoryAllocator};
use grundval_core::channel::{mpmc, spsc};
use grundval_core::shared::{PlainCounter, Shared};
use grundval_core::thread::{current_affinity, CpuTopology, ThreadBuilder};

use crate::error::EngineError;
use crate::runtime::Runtime;

/// Upper bound on blocks carved out by the allocation probe.
const PROBE_BLOCKS: usize = 8;

pub fn render_yaml<T: Serialize>(report: &T) -> Result<String, EngineError> {
    Ok(serde_yaml::to_string(report)?)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TopologyReport {
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub smt: bool,
    /// Cores the calling thread may run on; absent where the platform
    /// cannot report it.
    pub affinity: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsReport {
    pub allocations: usize,
    pub failed_allocations: usize,
    pub bytes_allocated: usize,
    pub resets: usize,
    pub commits: usize,
}

impl From<AllocatorStats> for StatsReport {
    fn from(stats: AllocatorStats) -> Self {
        Self {
            allocations: stats.allocations,
            failed_allocations: stats.failed_allocations,
            bytes_allocated: stats.bytes_allocated,
            resets: stats.resets,
            commits: stats.commits,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AllocProbeReport {
    pub page_size: usize,
    pub reserved_bytes: usize,
    pub committed_before: usize,
    pub committed_after: usize,
    pub blocks: usize,
    pub block_bytes: usize,
    pub offset_after_reset: usize,
    pub stats: StatsReport,
    pub scratch: ScratchReport,
}

/// Scratch arena usage around a temporary allocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScratchReport {
    pub name: String,
    pub capacity: usize,
    pub used_before: usize,
    pub used_peak: usize,
    pub used_after: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Mpmc,
    Spsc,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Mpmc => f.write_str("mpmc"),
            ChannelKind::Spsc => f.write_str("spsc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressOptions {
    pub kind: ChannelKind,
    pub producers: usize,
    pub items: u64,
    /// Requested channel capacity; the pool's configured capacity when `None`.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelReport {
    pub kind: ChannelKind,
    pub producers: usize,
    pub items: u64,
    pub capacity: usize,
    pub elapsed_ms: f64,
    pub items_per_sec: f64,
    /// Whether the consumer saw exactly the values the producers sent.
    pub checksum_ok: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolReport {
    pub tasks: usize,
    pub threads: usize,
    pub elapsed_ms: f64,
    pub mean_latency_ns: f64,
    /// Tasks executed by each worker, by worker index.
    pub per_worker: Vec<usize>,
    /// Tasks run by the closing thread rather than a worker.
    pub drained_inline: usize,
}

impl Runtime {
    pub fn topology(&self) -> TopologyReport {
        let topology = CpuTopology::detect();
        let affinity = match current_affinity() {
            Ok(cores) => Some(cores),
            Err(e) => {
                warn!(error = %e, "Affinity query failed");
                None
            }
        };
        TopologyReport {
            logical_cores: topology.logical_cores,
            physical_cores: topology.physical_cores,
            smt: topology.has_smt(),
            affinity,
        }
    }

    /// Carves commit-step sized blocks out of a fresh reserve/commit
    /// allocator sized by the config, then a temporary object out of the
    /// scratch arena.
    #[instrument(level = "info", name = "alloc_probe", skip(self))]
    pub fn alloc_probe(&self) -> Result<AllocProbeReport, EngineError> {
        let sizing = &self.config().allocator;
        let system = SystemMemoryAllocator::new(
            sizing.reserve_bytes,
            sizing.initial_commit_bytes,
            sizing.commit_step_bytes,
        )?
        .with_name("probe");

        let page_size = system.page_size();
        let block_bytes = sizing.commit_step_bytes;
        // One step of headroom: growth may commit a full step past the last block.
        let blocks = (system.reserved_size().saturating_sub(block_bytes) / (block_bytes + page_size))
            .min(PROBE_BLOCKS);
        let layout = Layout::from_size_align(block_bytes, 8)
            .map_err(|e| EngineError::InvalidWorkload(e.to_string()))?;

        let committed_before = system.committed_size();
        for _ in 0..blocks {
            system.allocate(layout)?;
        }
        let committed_after = system.committed_size();
        let stats = system.stats();
        system.reset();

        let report = AllocProbeReport {
            page_size,
            reserved_bytes: system.reserved_size(),
            committed_before,
            committed_after,
            blocks,
            block_bytes,
            offset_after_reset: system.offset(),
            stats: stats.into(),
            scratch: self.probe_scratch()?,
        };
        info!(
            blocks,
            committed = committed_after,
            "Allocation probe finished"
        );
        Ok(report)
    }

    fn probe_scratch(&self) -> Result<ScratchReport, EngineError> {
        let arena = &self.scratch;
        let scratch: AllocatorRef = arena.clone();
        let used_before = arena.used();
        let mark = arena.mark();

        let block = Shared::<[u64; 64], PlainCounter>::new_in(&scratch, [0; 64])?;
        let used_peak = arena.used();
        drop(block);
        arena.reset_to(mark)?;

        Ok(ScratchReport {
            name: scratch.name().to_owned(),
            capacity: arena.capacity(),
            used_before,
            used_peak,
            used_after: arena.used(),
        })
    }

    /// Moves `items` integers from `producers` threads to the calling thread
    /// and checks none were lost or duplicated.
    #[instrument(level = "info", name = "channel_stress", skip(self))]
    pub fn channel_stress(&self, options: StressOptions) -> Result<ChannelReport, EngineError> {
        if options.producers == 0 {
            return Err(EngineError::InvalidWorkload(
                "at least one producer is required".to_owned(),
            ));
        }
        if options.kind == ChannelKind::Spsc && options.producers != 1 {
            return Err(EngineError::InvalidWorkload(format!(
                "an SPSC channel takes exactly one producer, got {}",
                options.producers
            )));
        }
        let requested = options
            .capacity
            .unwrap_or(self.config().pool.channel_capacity);

        let start = Instant::now();
        let (capacity, sum) = match options.kind {
            ChannelKind::Mpmc => self.stress_mpmc(requested, options.producers, options.items)?,
            ChannelKind::Spsc => self.stress_spsc(requested, options.items)?,
        };
        let elapsed = start.elapsed().as_secs_f64();

        if let Some(metrics) = self.metrics() {
            metrics.record_channel_items(options.items);
        }

        let expected = u128::from(options.items) * u128::from(options.items.saturating_sub(1)) / 2;
        let report = ChannelReport {
            kind: options.kind,
            producers: options.producers,
            items: options.items,
            capacity,
            elapsed_ms: elapsed * 1_000.0,
            items_per_sec: if elapsed > 0.0 {
                options.items as f64 / elapsed
            } else {
                0.0
            },
            checksum_ok: sum == expected,
        };
        info!(
            kind = %report.kind,
            items_per_sec = report.items_per_sec,
            checksum_ok = report.checksum_ok,
            "Channel stress finished"
        );
        Ok(report)
    }

    fn stress_mpmc(
        &self,
        capacity: usize,
        producers: usize,
        items: u64,
    ) -> Result<(usize, u128), EngineError> {
        let (tx, rx) = mpmc::channel::<u64>(capacity, self.heap())?;

        let handles = (0..producers)
            .map(|p| {
                let tx = tx.clone();
                ThreadBuilder::new()
                    .name(format!("grundval-producer-{p}"))
                    .default_allocator(self.heap().clone())
                    .spawn(move || {
                        for value in (p as u64..items).step_by(producers) {
                            tx.push(value);
                        }
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let capacity = tx.capacity();
        drop(tx);

        let sum = (0..items).map(|_| u128::from(rx.pop())).sum();
        for handle in handles {
            handle.join()?;
        }
        Ok((capacity, sum))
    }

    fn stress_spsc(&self, capacity: usize, items: u64) -> Result<(usize, u128), EngineError> {
        let (mut tx, mut rx) = spsc::channel::<u64>(capacity, self.heap())?;
        let capacity = tx.capacity();

        let producer = ThreadBuilder::new()
            .name("grundval-producer-0")
            .default_allocator(self.heap().clone())
            .spawn(move || {
                for value in 0..items {
                    tx.push(value);
                }
            })?;

        let sum = (0..items).map(|_| u128::from(rx.pop())).sum();
        producer.join()?;
        Ok((capacity, sum))
    }

    /// Submits `tasks` small function tasks and waits for all of them.
    #[instrument(level = "info", name = "pool_workload", skip(self))]
    pub fn pool_workload(&self, tasks: usize) -> Result<PoolReport, EngineError> {
        let threads = self.pool().threads();
        let per_worker: Arc<Vec<AtomicUsize>> =
            Arc::new((0..threads).map(|_| AtomicUsize::new(0)).collect());
        let drained_inline = Arc::new(AtomicUsize::new(0));
        let total_latency_ns = Arc::new(AtomicU64::new(0));

        let start = Instant::now();
        let handles = (0..tasks)
            .map(|i| {
                let submitted = Instant::now();
                let per_worker = per_worker.clone();
                let drained_inline = drained_inline.clone();
                let total_latency_ns = total_latency_ns.clone();
                let metrics = self.metrics().cloned();
                self.pool().add_function_task(move |ctx| {
                    std::hint::black_box((0..256u64).fold(i as u64, |acc, x| acc ^ (acc << 1) ^ x));
                    match ctx.worker_index() {
                        Some(worker) => per_worker[worker].fetch_add(1, Ordering::Relaxed),
                        None => drained_inline.fetch_add(1, Ordering::Relaxed),
                    };
                    let latency = submitted.elapsed().as_nanos() as u64;
                    total_latency_ns.fetch_add(latency, Ordering::Relaxed);
                    if let Some(metrics) = metrics {
                        metrics.record_task(latency as f64);
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for handle in &handles {
            handle.wait_for_completion();
        }
        let elapsed = start.elapsed().as_secs_f64();

        let report = PoolReport {
            tasks,
            threads,
            elapsed_ms: elapsed * 1_000.0,
            mean_latency_ns: if tasks > 0 {
                total_latency_ns.load(Ordering::Relaxed) as f64 / tasks as f64
            } else {
                0.0
            },
            per_worker: per_worker
                .iter()
                .map(|count| count.load(Ordering::Relaxed))
                .collect(),
            drained_inline: drained_inline.load(Ordering::Relaxed),
        };
        info!(tasks, elapsed_ms = report.elapsed_ms, "Pool workload finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::{test_config, with_runtime};

    fn stress(kind: ChannelKind, producers: usize, items: u64) -> StressOptions {
        StressOptions {
            kind,
            producers,
            items,
            capacity: None,
        }
    }

    #[test]
    fn topology_matches_detection() {
        let report = with_runtime(test_config(), |runtime| runtime.topology());
        let detected = CpuTopology::detect();
        assert_eq!(report.logical_cores, detected.logical_cores);
        assert_eq!(report.smt, detected.has_smt());
        #[cfg(target_os = "linux")]
        assert!(!report.affinity.unwrap().is_empty());
    }

    #[test]
    fn alloc_probe_grows_the_commit_and_resets() {
        let report = with_runtime(test_config(), |runtime| runtime.alloc_probe().unwrap());
        assert_eq!(report.blocks, PROBE_BLOCKS);
        assert_eq!(report.stats.allocations, PROBE_BLOCKS);
        assert!(report.stats.commits >= 1);
        assert!(report.committed_after > report.committed_before);
        assert_eq!(report.offset_after_reset, 0);

        assert_eq!(report.scratch.name, "scratch");
        assert!(report.scratch.used_peak > report.scratch.used_before);
        assert_eq!(report.scratch.used_after, report.scratch.used_before);
    }

    #[test]
    fn mpmc_stress_delivers_every_item() {
        let report = with_runtime(test_config(), |runtime| {
            runtime
                .channel_stress(stress(ChannelKind::Mpmc, 4, 20_000))
                .unwrap()
        });
        assert!(report.checksum_ok);
        assert_eq!(report.capacity, 64);
    }

    #[test]
    fn spsc_stress_delivers_every_item() {
        let mut options = stress(ChannelKind::Spsc, 1, 20_000);
        options.capacity = Some(100);
        let report = with_runtime(test_config(), move |runtime| {
            runtime.channel_stress(options).unwrap()
        });
        assert!(report.checksum_ok);
        assert_eq!(report.capacity, 128);
    }

    #[test]
    fn stress_rejects_bad_producer_counts() {
        let (spsc_many, none) = with_runtime(test_config(), |runtime| {
            (
                matches!(
                    runtime.channel_stress(stress(ChannelKind::Spsc, 2, 10)),
                    Err(EngineError::InvalidWorkload(_))
                ),
                matches!(
                    runtime.channel_stress(stress(ChannelKind::Mpmc, 0, 10)),
                    Err(EngineError::InvalidWorkload(_))
                ),
            )
        });
        assert!(spsc_many);
        assert!(none);
    }

    #[test]
    fn stress_feeds_channel_metrics() {
        let text = with_runtime(test_config(), |runtime| {
            runtime
                .channel_stress(stress(ChannelKind::Mpmc, 2, 1_000))
                .unwrap();
            runtime.gather_metrics().unwrap().unwrap()
        });
        assert!(text.contains("grundval_channel_items_total 1000"));
    }

    #[test]
    fn pool_workload_runs_every_task() {
        let (report, text) = with_runtime(test_config(), |runtime| {
            let report = runtime.pool_workload(500).unwrap();
            (report, runtime.gather_metrics().unwrap().unwrap())
        });
        assert_eq!(report.threads, 2);
        assert_eq!(report.per_worker.len(), 2);
        assert_eq!(
            report.per_worker.iter().sum::<usize>() + report.drained_inline,
            500
        );
        assert!(text.contains("grundval_tasks_total 500"));
    }

    #[test]
    fn reports_render_as_yaml() {
        let report = ChannelReport {
            kind: ChannelKind::Spsc,
            producers: 1,
            items: 10,
            capacity: 16,
            elapsed_ms: 1.5,
            items_per_sec: 6_666.0,
            checksum_ok: true,
        };
        let yaml = render_yaml(&report).unwrap();
        assert!(yaml.contains("kind: spsc"));
        assert!(yaml.contains("checksum_ok: true"));
    }
}
