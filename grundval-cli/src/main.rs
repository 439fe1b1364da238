//! ## grundval-cli
//! **Command-line front-end for the grundval runtime**
//!
//! Loads the layered configuration, bootstraps a runtime on the main thread
//! and runs one built-in workload, printing its YAML report.

use clap::Parser;

mod commands;

use commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run_command(cli)
}
