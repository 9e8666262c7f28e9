//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// A top-like dashboard for monitoring ssh tunnels, or any tunnels.
#[derive(Debug, Parser)]
#[command(name = "tunneltop", version, about)]
pub struct Cli {
    /// Path to the tunnel configuration file (default: ~/.tunneltop.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Do not print the header row
    #[arg(short = 'n', long)]
    pub noheader: bool,

    /// Write debug information to ~/.tunneltop.log
    #[arg(short = 'g', long)]
    pub debug: bool,

    /// Delay between redraws in seconds
    #[arg(short, long, default_value_t = 5.0)]
    pub delay: f64,
}
