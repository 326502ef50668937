//! Single-threaded HTTP polling worker.
//!
//! Each worker is an actor task that exclusively owns the customers placed
//! on it, their host/schemes and monitors, the per-interval timers, and one
//! HTTP client. Everything that mutates worker state arrives as a message:
//! control-plane commands from the pool and the API, lookup requests with
//! oneshot replies, and probe completions posted back by the request tasks
//! the worker spawned. The loop interleaves message handling with the
//! earliest timer deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::info;

use crate::aggregator::{DataAggregator, EventRecord};
use crate::customer::Customer;
use crate::monitor::{self, CheckContext, ContentCheckMode, HttpMethod, MonitorEffect, MonitorStatus, ProbeOutcome, TRANSFER_TIMEOUT};
use crate::monitor::DefaultHeaders;
use crate::pool::PoolTelemetry;
use crate::timer::HostSchemeTimer;
use crate::types::{now_ms, now_secs, CustomerId, HostSchemeId, LoadingData, MonitorId};

/// Read-only views returned to the inbound API.
#[derive(Debug, Clone)]
pub struct CustomerSnapshot {
    pub id: CustomerId,
    pub supports_ping_testing: bool,
    pub supports_ssl_expiration_checking: bool,
    pub supports_latency_measurements: bool,
    pub supports_multi_region_testing: bool,
    pub polling_interval: u32,
    pub paused: bool,
    pub host_scheme_count: usize,
    pub monitor_count: usize,
}

#[derive(Debug, Clone)]
pub struct HostSchemeSnapshot {
    pub id: HostSchemeId,
    pub customer_id: CustomerId,
    pub url: url::Url,
    pub ssl_expiration_timestamp: u64,
    pub monitor_ids: Vec<MonitorId>,
}

#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub id: MonitorId,
    pub customer_id: CustomerId,
    pub host_scheme_id: HostSchemeId,
    pub path: String,
    pub method: HttpMethod,
    pub check_mode: ContentCheckMode,
    pub status: MonitorStatus,
}

enum WorkerCommand {
    AddCustomer {
        customer: Customer,
        reply: oneshot::Sender<()>,
    },
    RemoveCustomer {
        customer_id: CustomerId,
        reply: oneshot::Sender<bool>,
    },
    SetPaused {
        customer_id: CustomerId,
        paused: bool,
        reply: oneshot::Sender<bool>,
    },
    UpdateRegionData {
        region_index: u32,
        number_regions: u32,
    },
    GoActive,
    GoInactive,
    LoadingData {
        reply: oneshot::Sender<Vec<(i64, LoadingData)>>,
    },
    GetCustomer {
        customer_id: CustomerId,
        reply: oneshot::Sender<Option<CustomerSnapshot>>,
    },
    GetHostScheme {
        host_scheme_id: HostSchemeId,
        reply: oneshot::Sender<Option<HostSchemeSnapshot>>,
    },
    GetMonitor {
        monitor_id: MonitorId,
        reply: oneshot::Sender<Option<MonitorSnapshot>>,
    },
    ProbeDone {
        monitor_id: MonitorId,
        outcome: ProbeOutcome,
    },
}

/// Handle to one worker task.
#[derive(Clone)]
pub struct HttpWorker {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    index: usize,
}

impl HttpWorker {
    pub fn start(
        index: usize,
        aggregator: Arc<DataAggregator>,
        telemetry: Arc<PoolTelemetry>,
        default_headers: watch::Receiver<DefaultHeaders>,
        shutdown: watch::Receiver<()>,
    ) -> Result<Self> {
        let client = build_probe_client()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = WorkerTask {
            index,
            client,
            aggregator,
            telemetry,
            default_headers,
            self_tx: tx.clone(),
            customers: HashMap::new(),
            host_scheme_index: HashMap::new(),
            monitor_index: HashMap::new(),
            timers: BTreeMap::new(),
            probes: HashMap::new(),
            region_index: 0,
            number_regions: 0,
            active: false,
        };
        tokio::spawn(task.run(rx, shutdown));

        Ok(Self { tx, index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn add_customer(&self, customer: Customer) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::AddCustomer { customer, reply })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn remove_customer(&self, customer_id: CustomerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::RemoveCustomer { customer_id, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_paused(&self, customer_id: CustomerId, paused: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::SetPaused {
                customer_id,
                paused,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn update_region_data(&self, region_index: u32, number_regions: u32) {
        let _ = self.tx.send(WorkerCommand::UpdateRegionData {
            region_index,
            number_regions,
        });
    }

    pub fn go_active(&self) {
        let _ = self.tx.send(WorkerCommand::GoActive);
    }

    pub fn go_inactive(&self) {
        let _ = self.tx.send(WorkerCommand::GoInactive);
    }

    pub async fn loading_data(&self) -> Vec<(i64, LoadingData)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::LoadingData { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_customer(&self, customer_id: CustomerId) -> Option<CustomerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::GetCustomer { customer_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn get_host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<HostSchemeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::GetHostScheme {
                host_scheme_id,
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn get_monitor(&self, monitor_id: MonitorId) -> Option<MonitorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::GetMonitor { monitor_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Probe client: no https-to-http redirects, transfer deadline, and TLS
/// peer-certificate capture for expiry tracking.
fn build_probe_client() -> Result<reqwest::Client> {
    let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
        let downgrade = attempt.url().scheme() == "http"
            && attempt.previous().iter().any(|url| url.scheme() == "https");
        if downgrade {
            attempt.stop()
        } else if attempt.previous().len() >= 10 {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    });

    reqwest::Client::builder()
        .redirect(redirect_policy)
        .timeout(TRANSFER_TIMEOUT)
        .tls_info(true)
        .build()
        .context("building probe HTTP client")
}

struct WorkerTask {
    index: usize,
    client: reqwest::Client,
    aggregator: Arc<DataAggregator>,
    telemetry: Arc<PoolTelemetry>,
    default_headers: watch::Receiver<DefaultHeaders>,
    self_tx: mpsc::UnboundedSender<WorkerCommand>,
    customers: HashMap<CustomerId, Customer>,
    host_scheme_index: HashMap<HostSchemeId, CustomerId>,
    monitor_index: HashMap<MonitorId, (CustomerId, HostSchemeId)>,
    /// Timers keyed by signed polling interval (positive = multi-region).
    timers: BTreeMap<i64, HostSchemeTimer>,
    /// In-flight probe tasks by monitor, aborted when the owner goes away.
    probes: HashMap<MonitorId, JoinHandle<()>>,
    region_index: u32,
    number_regions: u32,
    active: bool,
}

impl WorkerTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
        mut shutdown: watch::Receiver<()>,
    ) {
        info!(worker = self.index, "HTTP worker started");

        loop {
            let deadline = self.earliest_fire_ms();

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                _ = sleep_until_wall_clock(deadline), if deadline.is_some() => {
                    self.fire_due_timers();
                }
            }
        }

        for (_, probe) in self.probes.drain() {
            probe.abort();
        }
        info!(worker = self.index, "HTTP worker finished");
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::AddCustomer { customer, reply } => {
                self.add_customer(customer);
                let _ = reply.send(());
            }
            WorkerCommand::RemoveCustomer { customer_id, reply } => {
                let _ = reply.send(self.remove_customer(customer_id));
            }
            WorkerCommand::SetPaused {
                customer_id,
                paused,
                reply,
            } => {
                let found = match self.customers.get_mut(&customer_id) {
                    Some(customer) => {
                        customer.paused = paused;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            WorkerCommand::UpdateRegionData {
                region_index,
                number_regions,
            } => {
                self.region_index = region_index;
                self.number_regions = number_regions;
                self.active = true;
                let now = now_ms();
                for timer in self.timers.values_mut() {
                    timer.set_active(true);
                    timer.update_region_data(region_index, number_regions, now);
                }
            }
            WorkerCommand::GoActive => {
                self.active = true;
                let now = now_ms();
                for timer in self.timers.values_mut() {
                    timer.go_active(now);
                }
            }
            WorkerCommand::GoInactive => {
                self.active = false;
                for timer in self.timers.values_mut() {
                    timer.go_inactive();
                }
            }
            WorkerCommand::LoadingData { reply } => {
                let data = self
                    .timers
                    .iter()
                    .map(|(&interval, timer)| (interval, timer.loading_data()))
                    .collect();
                let _ = reply.send(data);
            }
            WorkerCommand::GetCustomer { customer_id, reply } => {
                let snapshot = self.customers.get(&customer_id).map(customer_snapshot);
                let _ = reply.send(snapshot);
            }
            WorkerCommand::GetHostScheme {
                host_scheme_id,
                reply,
            } => {
                let _ = reply.send(self.host_scheme_snapshot(host_scheme_id));
            }
            WorkerCommand::GetMonitor { monitor_id, reply } => {
                let _ = reply.send(self.monitor_snapshot(monitor_id));
            }
            WorkerCommand::ProbeDone {
                monitor_id,
                outcome,
            } => {
                self.probes.remove(&monitor_id);
                self.apply_probe_outcome(monitor_id, outcome);
            }
        }
    }

    fn add_customer(&mut self, customer: Customer) {
        let customer_id = customer.id;
        let signed_interval = customer.signed_polling_interval();
        let now = now_ms();

        let timer = self.timers.entry(signed_interval).or_insert_with(|| {
            HostSchemeTimer::new(
                customer.supports_multi_region_testing,
                customer.polling_interval,
                self.region_index,
                self.number_regions,
                self.active,
                now,
            )
        });

        for host_scheme in customer.host_schemes() {
            timer.add_host_scheme(host_scheme.id, now);
            self.host_scheme_index.insert(host_scheme.id, customer_id);
            for monitor in host_scheme.monitors() {
                self.monitor_index
                    .insert(monitor.id, (customer_id, host_scheme.id));
            }
        }

        info!(
            worker = self.index,
            customer = customer_id,
            ping = customer.supports_ping_testing,
            ssl = customer.supports_ssl_expiration_checking,
            latency = customer.supports_latency_measurements,
            multi_region = customer.supports_multi_region_testing,
            polling_interval = customer.polling_interval,
            paused = customer.paused,
            hosts = customer.host_scheme_count(),
            monitors = customer.monitor_count(),
            "added customer"
        );

        self.customers.insert(customer_id, customer);
        self.update_service_metrics();
    }

    fn remove_customer(&mut self, customer_id: CustomerId) -> bool {
        let Some(customer) = self.customers.remove(&customer_id) else {
            return false;
        };

        let signed_interval = customer.signed_polling_interval();
        for host_scheme in customer.host_schemes() {
            if let Some(timer) = self.timers.get_mut(&signed_interval) {
                timer.remove_host_scheme(host_scheme.id);
            }
            self.host_scheme_index.remove(&host_scheme.id);
            for monitor in host_scheme.monitors() {
                self.monitor_index.remove(&monitor.id);
                // Aborted requests produce no events.
                if let Some(probe) = self.probes.remove(&monitor.id) {
                    probe.abort();
                }
            }
        }

        info!(worker = self.index, customer = customer_id, "removed customer");
        self.update_service_metrics();
        true
    }

    fn earliest_fire_ms(&self) -> Option<u64> {
        self.timers
            .values()
            .filter_map(HostSchemeTimer::next_fire_ms)
            .min()
    }

    fn fire_due_timers(&mut self) {
        let now = now_ms();
        let intervals: Vec<i64> = self.timers.keys().copied().collect();

        for interval in intervals {
            loop {
                let fired = {
                    let Some(timer) = self.timers.get_mut(&interval) else {
                        break;
                    };
                    match timer.next_fire_ms() {
                        Some(at) if at <= now => timer.fire(now),
                        _ => break,
                    }
                };
                if let Some(host_scheme_id) = fired {
                    self.service_host_scheme(host_scheme_id);
                }
            }
        }
    }

    /// One timer tick for a host/scheme: advance its cursors and start the
    /// picked monitors.
    fn service_host_scheme(&mut self, host_scheme_id: HostSchemeId) {
        let Some(&customer_id) = self.host_scheme_index.get(&host_scheme_id) else {
            return;
        };
        let Some(customer) = self.customers.get_mut(&customer_id) else {
            return;
        };
        let paused = customer.paused;
        let Some(host_scheme) = customer.host_scheme_mut(host_scheme_id) else {
            return;
        };

        let picks = host_scheme.service_next_monitor();
        if paused {
            // The timer still ticks; no request is issued and no status
            // transition happens.
            return;
        }

        let base_url = host_scheme.url.clone();
        for monitor_id in picks {
            let Some(monitor) = host_scheme.monitor_mut(monitor_id) else {
                continue;
            };
            if !monitor.begin_check() {
                continue;
            }
            let spec = monitor.probe_spec(&base_url, self.default_headers.borrow().clone());

            let client = self.client.clone();
            let tx = self.self_tx.clone();
            let probe = tokio::spawn(async move {
                let outcome = monitor::execute_probe(client, spec).await;
                let _ = tx.send(WorkerCommand::ProbeDone {
                    monitor_id,
                    outcome,
                });
            });
            self.probes.insert(monitor_id, probe);
        }
    }

    fn apply_probe_outcome(&mut self, monitor_id: MonitorId, outcome: ProbeOutcome) {
        // A completion for an unknown monitor raced a customer removal;
        // discarded without events.
        let Some(&(customer_id, host_scheme_id)) = self.monitor_index.get(&monitor_id) else {
            return;
        };
        let Some(customer) = self.customers.get_mut(&customer_id) else {
            return;
        };
        let context = CheckContext {
            latency_enabled: customer.supports_latency_measurements,
        };
        let Some(host_scheme) = customer.host_scheme_mut(host_scheme_id) else {
            return;
        };
        let Some(monitor) = host_scheme.monitor_mut(monitor_id) else {
            return;
        };

        let effects = monitor.apply_outcome(outcome, &context);

        for effect in effects {
            match effect {
                MonitorEffect::Event {
                    event_type,
                    status,
                    hash,
                    message,
                } => {
                    self.aggregator.report_event(EventRecord {
                        monitor_id,
                        timestamp: now_secs(),
                        event_type,
                        monitor_status: status,
                        message,
                        hash,
                    });
                }
                MonitorEffect::NowFailed => host_scheme.monitor_non_responsive(monitor_id),
                MonitorEffect::NowResponsive => host_scheme.monitor_now_responsive(monitor_id),
                MonitorEffect::Latency {
                    timestamp,
                    microseconds,
                } => {
                    self.aggregator
                        .record_latency(monitor_id, timestamp, microseconds);
                }
                MonitorEffect::CertificateObserved { expiry } => {
                    if host_scheme.ssl_expiration_timestamp != expiry {
                        host_scheme.ssl_expiration_timestamp = expiry;
                        self.aggregator
                            .report_certificate(monitor_id, host_scheme_id, expiry);
                    }
                }
            }
        }
    }

    fn update_service_metrics(&self) {
        let rate: f64 = self
            .timers
            .values()
            .map(HostSchemeTimer::host_schemes_per_second)
            .sum();
        self.telemetry.set_worker_rate(self.index, rate);
    }

    fn host_scheme_snapshot(&self, host_scheme_id: HostSchemeId) -> Option<HostSchemeSnapshot> {
        let &customer_id = self.host_scheme_index.get(&host_scheme_id)?;
        let customer = self.customers.get(&customer_id)?;
        let host_scheme = customer.host_scheme(host_scheme_id)?;
        Some(HostSchemeSnapshot {
            id: host_scheme.id,
            customer_id,
            url: host_scheme.url.clone(),
            ssl_expiration_timestamp: host_scheme.ssl_expiration_timestamp,
            monitor_ids: host_scheme.monitor_ids().collect(),
        })
    }

    fn monitor_snapshot(&self, monitor_id: MonitorId) -> Option<MonitorSnapshot> {
        let &(customer_id, host_scheme_id) = self.monitor_index.get(&monitor_id)?;
        let customer = self.customers.get(&customer_id)?;
        let monitor = customer.host_scheme(host_scheme_id)?.monitor(monitor_id)?;
        Some(MonitorSnapshot {
            id: monitor.id,
            customer_id,
            host_scheme_id,
            path: monitor.path.clone(),
            method: monitor.method,
            check_mode: monitor.check_mode,
            status: monitor.status,
        })
    }
}

fn customer_snapshot(customer: &Customer) -> CustomerSnapshot {
    CustomerSnapshot {
        id: customer.id,
        supports_ping_testing: customer.supports_ping_testing,
        supports_ssl_expiration_checking: customer.supports_ssl_expiration_checking,
        supports_latency_measurements: customer.supports_latency_measurements,
        supports_multi_region_testing: customer.supports_multi_region_testing,
        polling_interval: customer.polling_interval,
        paused: customer.paused,
        host_scheme_count: customer.host_scheme_count(),
        monitor_count: customer.monitor_count(),
    }
}

async fn sleep_until_wall_clock(deadline: Option<u64>) {
    match deadline {
        Some(at) => {
            let delay = at.saturating_sub(now_ms());
            sleep(Duration::from_millis(delay)).await;
        }
        None => std::future::pending().await,
    }
}
