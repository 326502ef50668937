//! PollWatch - Regional Endpoint Polling Server
//!
//! Probes customer-configured HTTP(S) endpoints on a phase-coherent
//! schedule, coordinates an external ICMP pinger, and streams latency and
//! anomaly telemetry to the central controller.

use std::process::ExitCode;

use clap::Parser;
use pollwatch::{app, cli::Cli, config::Config};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let configuration = match Config::load(&cli.configuration_file) {
        Ok(configuration) => configuration,
        Err(config_error) => {
            error!(
                path = %cli.configuration_file.display(),
                error = %config_error,
                "failed to load configuration"
            );
            return ExitCode::from(1);
        }
    };

    match app::run(cli.configuration_file, configuration).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "polling server failed");
            ExitCode::from(1)
        }
    }
}
