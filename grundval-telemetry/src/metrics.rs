//! ## grundval-telemetry::metrics
//! **Prometheus recorder for runtime workloads**

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub tasks: IntCounter,
    pub channel_items: IntCounter,
    pub task_latency: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let tasks = IntCounter::new("grundval_tasks_total", "Tasks executed by the thread pool")?;
        let channel_items = IntCounter::new(
            "grundval_channel_items_total",
            "Items moved through channels",
        )?;
        let task_latency = Histogram::with_opts(
            HistogramOpts::new(
                "grundval_task_latency_ns",
                "Submission-to-completion time of pool tasks",
            )
            .buckets(vec![1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0]),
        )?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(channel_items.clone()))?;
        registry.register(Box::new(task_latency.clone()))?;

        Ok(Self {
            registry,
            tasks,
            channel_items,
            task_latency,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn record_task(&self, latency_ns: f64) {
        self.tasks.inc();
        self.task_latency.observe(latency_ns);
    }

    pub fn record_channel_items(&self, items: u64) {
        self.channel_items.inc_by(items);
    }
}
