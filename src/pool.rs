//! Worker pool: customer placement, lookup routing, and server status.
//!
//! The pool owns `max(1, logical cores)` HTTP workers plus one ping
//! controller. Customers land on the worker with the lowest host/schemes-
//! per-second rate; lookups fan out across workers and return the first
//! hit. Status transitions cascade into every worker and the pinger, and
//! each one triggers an immediate aggregator flush so the controller sees
//! the change promptly.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::aggregator::DataAggregator;
use crate::customer::Customer;
use crate::monitor::DefaultHeaders;
use crate::ping::PingController;
use crate::types::{CustomerId, HostSchemeId, LoadingData, MonitorId, ServerStatus};
use crate::worker::{CustomerSnapshot, HostSchemeSnapshot, HttpWorker, MonitorSnapshot};

/// Shared pool counters read by the aggregator when it builds report
/// headers: per-worker service rates and the server status.
pub struct PoolTelemetry {
    rates: Vec<AtomicU64>,
    status: AtomicU8,
}

impl PoolTelemetry {
    pub fn new(worker_count: usize) -> Self {
        Self {
            rates: (0..worker_count).map(|_| AtomicU64::new(0)).collect(),
            status: AtomicU8::new(ServerStatus::Inactive.code()),
        }
    }

    pub fn set_worker_rate(&self, index: usize, rate: f64) {
        if let Some(cell) = self.rates.get(index) {
            cell.store(rate.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn worker_rate(&self, index: usize) -> f64 {
        self.rates
            .get(index)
            .map(|cell| f64::from_bits(cell.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    /// Aggregate service rate across all workers.
    pub fn monitors_per_second(&self) -> f64 {
        self.rates
            .iter()
            .map(|cell| f64::from_bits(cell.load(Ordering::Relaxed)))
            .sum()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_code(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.status.store(status.code(), Ordering::Relaxed);
    }
}

pub struct WorkerPool {
    workers: Vec<HttpWorker>,
    ping: PingController,
    telemetry: Arc<PoolTelemetry>,
    aggregator: Arc<DataAggregator>,
}

impl WorkerPool {
    pub fn start(
        worker_count: usize,
        aggregator: Arc<DataAggregator>,
        telemetry: Arc<PoolTelemetry>,
        default_headers: watch::Receiver<DefaultHeaders>,
        shutdown: watch::Receiver<()>,
    ) -> Result<Self> {
        let ping = PingController::start(shutdown.clone());

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count.max(1) {
            workers.push(HttpWorker::start(
                index,
                aggregator.clone(),
                telemetry.clone(),
                default_headers.clone(),
                shutdown.clone(),
            )?);
        }

        Ok(Self {
            workers,
            ping,
            telemetry,
            aggregator,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn ping_controller(&self) -> &PingController {
        &self.ping
    }

    pub fn status(&self) -> ServerStatus {
        self.telemetry.status()
    }

    pub fn monitors_per_second(&self) -> f64 {
        self.telemetry.monitors_per_second()
    }

    /// Places a customer on the least-loaded worker and registers its hosts
    /// with the pinger when ping testing is enabled.
    pub async fn add_customer(&self, customer: Customer) {
        let customer_id = customer.id;
        let ping_hosts: Vec<(HostSchemeId, String)> = if customer.supports_ping_testing {
            customer
                .host_schemes()
                .map(|host_scheme| {
                    (
                        host_scheme.id,
                        host_scheme.url.host_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        let index = self.least_loaded_index();
        self.workers[index].add_customer(customer).await;

        for (host_scheme_id, host) in ping_hosts {
            self.ping.add_host(customer_id, host_scheme_id, host);
        }
    }

    /// Removes a customer, probing workers in order until one owns it.
    pub async fn remove_customer(&self, customer_id: CustomerId) -> bool {
        let mut removed = false;
        for worker in &self.workers {
            if worker.remove_customer(customer_id).await {
                removed = true;
                break;
            }
        }
        self.ping.remove_customer(customer_id);
        removed
    }

    pub async fn set_paused(&self, customer_id: CustomerId, paused: bool) -> bool {
        for worker in &self.workers {
            if worker.set_paused(customer_id, paused).await {
                return true;
            }
        }
        false
    }

    pub async fn get_customer(&self, customer_id: CustomerId) -> Option<CustomerSnapshot> {
        for worker in &self.workers {
            if let Some(snapshot) = worker.get_customer(customer_id).await {
                return Some(snapshot);
            }
        }
        None
    }

    pub async fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<HostSchemeSnapshot> {
        for worker in &self.workers {
            if let Some(snapshot) = worker.get_host_scheme(host_scheme_id).await {
                return Some(snapshot);
            }
        }
        None
    }

    pub async fn get_monitor(&self, monitor_id: MonitorId) -> Option<MonitorSnapshot> {
        for worker in &self.workers {
            if let Some(snapshot) = worker.get_monitor(monitor_id).await {
                return Some(snapshot);
            }
        }
        None
    }

    /// Loading snapshots from every worker, keyed by signed interval.
    pub async fn loading_data(&self) -> Vec<(i64, LoadingData)> {
        let mut data = Vec::new();
        for worker in &self.workers {
            data.extend(worker.loading_data().await);
        }
        data
    }

    /// Applies new region coordinates everywhere and forces ACTIVE.
    pub fn update_region_data(&self, region_index: u32, number_regions: u32) {
        for worker in &self.workers {
            worker.update_region_data(region_index, number_regions);
        }
        self.ping.go_active();

        info!(region = region_index, regions = number_regions, "changing region");
        self.transition(ServerStatus::Active, "region change");
    }

    /// Toggles between ACTIVE and INACTIVE.
    pub fn go_active(&self, now_active: bool) {
        for worker in &self.workers {
            if now_active {
                worker.go_active();
            } else {
                worker.go_inactive();
            }
        }
        if now_active {
            self.ping.go_active();
        } else {
            self.ping.go_inactive();
        }

        let status = if now_active {
            ServerStatus::Active
        } else {
            ServerStatus::Inactive
        };
        self.transition(status, "state change");
    }

    fn transition(&self, status: ServerStatus, reason: &str) {
        let previous = self.telemetry.status();
        if previous != status {
            info!(
                from = previous.as_str(),
                to = status.as_str(),
                reason,
                "server status transition"
            );
        }
        self.telemetry.set_status(status);
        self.aggregator.send_report();
    }

    fn least_loaded_index(&self) -> usize {
        let mut best = 0;
        let mut best_rate = self.telemetry.worker_rate(0);
        for index in 1..self.workers.len() {
            let rate = self.telemetry.worker_rate(index);
            if rate < best_rate {
                best = index;
                best_rate = rate;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_sums_worker_rates() {
        let telemetry = PoolTelemetry::new(3);
        telemetry.set_worker_rate(0, 1.5);
        telemetry.set_worker_rate(1, 0.25);
        telemetry.set_worker_rate(2, 0.25);
        assert!((telemetry.monitors_per_second() - 2.0).abs() < 1e-9);
        assert!((telemetry.worker_rate(1) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn status_starts_inactive() {
        let telemetry = PoolTelemetry::new(1);
        assert_eq!(telemetry.status(), ServerStatus::Inactive);
        telemetry.set_status(ServerStatus::Active);
        assert_eq!(telemetry.status(), ServerStatus::Active);
    }
}
