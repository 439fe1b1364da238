use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use grundval_config::RuntimeConfig;
use grundval_engine::{render_yaml, ChannelKind, Runtime, StressOptions};

#[derive(Parser, Debug)]
#[command(name = "grundval", version, about)]
pub struct Cli {
    /// Configuration file; `config/grundval.yaml` plus environment when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report logical/physical cores and the current affinity set
    Topology,
    /// Exercise the reserve/commit allocator and the scratch arena
    AllocProbe,
    /// Push integers through a channel from producer threads
    ChannelStress(StressArgs),
    /// Run small tasks on the worker pool
    Pool(PoolArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Mpmc,
    Spsc,
}

impl From<KindArg> for ChannelKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mpmc => ChannelKind::Mpmc,
            KindArg::Spsc => ChannelKind::Spsc,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StressArgs {
    #[arg(long, value_enum, default_value_t = KindArg::Mpmc)]
    pub kind: KindArg,
    #[arg(long, default_value_t = 1)]
    pub producers: usize,
    #[arg(long, default_value_t = 1_000_000)]
    pub items: u64,
    /// Channel capacity (defaults to the pool's configured capacity)
    #[arg(long)]
    pub capacity: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    #[arg(long, default_value_t = 10_000)]
    pub tasks: usize,
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::load().context("loading configuration")?,
    };
    grundval_telemetry::init_logging(&config.telemetry.log_level);

    let runtime = Runtime::bootstrap(config)?;
    let report = match cli.command {
        Commands::Topology => render_yaml(&runtime.topology())?,
        Commands::AllocProbe => render_yaml(&runtime.alloc_probe()?)?,
        Commands::ChannelStress(args) => render_yaml(&runtime.channel_stress(StressOptions {
            kind: args.kind.into(),
            producers: args.producers,
            items: args.items,
            capacity: args.capacity,
        })?)?,
        Commands::Pool(args) => render_yaml(&runtime.pool_workload(args.tasks)?)?,
    };
    print!("{report}");

    if let Some(metrics) = runtime.gather_metrics()? {
        println!("---");
        print!("{metrics}");
    }
    runtime.shutdown();
    info!("Done");
    Ok(())
}
