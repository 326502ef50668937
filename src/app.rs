//! The main application logic, decoupled from the entry point.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::aggregator::DataAggregator;
use crate::api::{self, ApiState};
use crate::config::{self, Config};
use crate::monitor::DefaultHeaders;
use crate::outbound::OutboundClient;
use crate::ping::resolve_socket_path;
use crate::pool::{PoolTelemetry, WorkerPool};

/// Runs the polling server until ctrl-c.
pub async fn run(configuration_path: PathBuf, configuration: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // =========================================================================
    // 1. Outbound reporting fabric
    // =========================================================================
    let worker_count = num_cpus::get().max(1);
    let telemetry = Arc::new(PoolTelemetry::new(worker_count));
    let outbound = Arc::new(OutboundClient::new(
        configuration.database_server.clone(),
        configuration.outbound_api_key.clone(),
    )?);
    let aggregator = DataAggregator::start(
        outbound.clone(),
        telemetry.clone(),
        &configuration.server_identifier,
        shutdown_rx.clone(),
    );

    // =========================================================================
    // 2. Worker pool and ping controller
    // =========================================================================
    let (headers_tx, headers_rx) =
        watch::channel::<DefaultHeaders>(Arc::new(configuration.headers.clone()));
    let pool = Arc::new(WorkerPool::start(
        worker_count,
        aggregator.clone(),
        telemetry,
        headers_rx,
        shutdown_rx.clone(),
    )?);
    pool.ping_controller()
        .connect(resolve_socket_path(&configuration.pinger));
    info!(workers = worker_count, "worker pool started");

    // =========================================================================
    // 3. Inbound control API
    // =========================================================================
    let inbound_secret = Arc::new(RwLock::new(configuration.inbound_api_key.clone()));
    let api_state = Arc::new(ApiState {
        pool: pool.clone(),
        inbound_secret: inbound_secret.clone(),
    });

    let listener = TcpListener::bind(("0.0.0.0", configuration.inbound_port))
        .await
        .with_context(|| format!("binding inbound port {}", configuration.inbound_port))?;
    info!(port = configuration.inbound_port, "inbound API listening");
    let api_task = tokio::spawn(api::serve(listener, api_state, shutdown_rx.clone()));

    // =========================================================================
    // 4. Configuration hot reload
    // =========================================================================
    {
        let outbound = outbound.clone();
        let aggregator = aggregator.clone();
        let inbound_secret = inbound_secret.clone();
        let ping = pool.ping_controller().clone();
        let initial_port = configuration.inbound_port;

        config::spawn_watcher(configuration_path, shutdown_rx.clone(), move |reloaded| {
            outbound.reconfigure(
                reloaded.database_server.clone(),
                reloaded.outbound_api_key.clone(),
            );
            if let Ok(mut secret) = inbound_secret.write() {
                *secret = reloaded.inbound_api_key.clone();
            }
            aggregator.set_server_identifier(&reloaded.server_identifier);
            let _ = headers_tx.send(Arc::new(reloaded.headers.clone()));
            ping.connect(resolve_socket_path(&reloaded.pinger));

            if reloaded.inbound_port != initial_port {
                warn!(
                    configured = reloaded.inbound_port,
                    active = initial_port,
                    "inbound port change requires a restart"
                );
            }
        })?;
    }

    info!("polling server started");

    // =========================================================================
    // 5. Wait for shutdown
    // =========================================================================
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    if let Err(error) = api_task.await {
        warn!(error = %error, "inbound API task ended abnormally");
    }
    info!("polling server stopped");

    Ok(())
}
