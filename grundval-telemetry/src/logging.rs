//! ## grundval-telemetry::logging
//! **`tracing` subscriber bootstrap**
//!
//! Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to the
//! configured level. Output goes to stderr, leaving stdout to reports.
//! Thread names are printed so pool workers (`grundval-worker-N`) are
//! identifiable.

use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Returns `false` when one was already
/// installed, which is not an error: tests and embedding applications may
/// have set their own.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let installed = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .try_init()
        .is_ok();
    if installed {
        debug!(level, "Logging initialized");
    }
    installed
}
