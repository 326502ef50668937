//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// A regional polling server: probes customer endpoints on a phase-coherent
/// schedule and streams latency and anomaly telemetry to the controller.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(value_name = "CONFIGURATION_FILE")]
    pub configuration_file: PathBuf,
}
