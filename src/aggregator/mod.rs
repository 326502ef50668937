//! Telemetry aggregation and reporting to the controller.
//!
//! Three independent channels: latency samples are batched under a mutex and
//! shipped as a packed binary report; anomaly events go out one at a time in
//! submission order; certificate-expiry changes are fire-and-forget retry
//! tasks. All three retry transport and protocol failures without dropping
//! payloads.

pub mod certs;
pub mod events;

pub use events::{EventRecord, EventType};

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{info, warn};

use crate::outbound::{is_accepted, response_status, OutboundClient};
use crate::pool::PoolTelemetry;
use crate::resources;
use crate::types::{zoran_timestamp, HostSchemeId, MonitorId};

pub const LATENCY_RECORD_PATH: &str = "/latency/record";

/// Pending entries that force an immediate flush.
pub const MAXIMUM_PENDING_ENTRIES: usize = 1000;

/// Longest a non-empty pending list waits before being reported.
pub const REPORT_DELAY: Duration = Duration::from_secs(60);

/// Delay before re-sending a failed report.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Identifier bytes in the report header; longer identifiers truncate.
pub const MAXIMUM_IDENTIFIER_LENGTH: usize = 48;

const HEADER_LENGTH: usize = 64;

/// One latency sample, as recorded by a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyEntry {
    pub monitor_id: MonitorId,
    pub unix_timestamp: u64,
    pub latency_microseconds: u32,
}

enum Trigger {
    /// New entries arrived; arm the report timer if idle.
    Poke,
    /// Flush as soon as the channel is free.
    FlushNow,
}

pub struct DataAggregator {
    pending: Mutex<Vec<LatencyEntry>>,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    events_tx: mpsc::UnboundedSender<EventRecord>,
    outbound: Arc<OutboundClient>,
    telemetry: Arc<PoolTelemetry>,
    identifier: RwLock<[u8; MAXIMUM_IDENTIFIER_LENGTH]>,
    shutdown: watch::Receiver<()>,
}

impl DataAggregator {
    /// Creates the aggregator and spawns its latency and event loops.
    pub fn start(
        outbound: Arc<OutboundClient>,
        telemetry: Arc<PoolTelemetry>,
        server_identifier: &str,
        shutdown: watch::Receiver<()>,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let aggregator = Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            trigger_tx,
            events_tx,
            outbound: outbound.clone(),
            telemetry,
            identifier: RwLock::new([0; MAXIMUM_IDENTIFIER_LENGTH]),
            shutdown: shutdown.clone(),
        });
        aggregator.set_server_identifier(server_identifier);

        tokio::spawn(latency_loop(aggregator.clone(), trigger_rx, shutdown.clone()));
        tokio::spawn(events::run(events_rx, outbound, shutdown));

        aggregator
    }

    pub fn set_server_identifier(&self, identifier: &str) {
        let mut padded = [0u8; MAXIMUM_IDENTIFIER_LENGTH];
        let raw = identifier.as_bytes();
        let length = raw.len().min(MAXIMUM_IDENTIFIER_LENGTH);
        padded[..length].copy_from_slice(&raw[..length]);
        if let Ok(mut identifier) = self.identifier.write() {
            *identifier = padded;
        }
    }

    /// Records one latency sample. Thread safe; the critical section is a
    /// single push.
    pub fn record_latency(&self, monitor_id: MonitorId, unix_timestamp: u64, microseconds: u32) {
        let reached_threshold = {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(_) => return,
            };
            pending.push(LatencyEntry {
                monitor_id,
                unix_timestamp,
                latency_microseconds: microseconds,
            });
            pending.len() >= MAXIMUM_PENDING_ENTRIES
        };

        let trigger = if reached_threshold {
            Trigger::FlushNow
        } else {
            Trigger::Poke
        };
        let _ = self.trigger_tx.send(trigger);
    }

    /// Queues an anomaly event; submission order is preserved.
    pub fn report_event(&self, record: EventRecord) {
        let _ = self.events_tx.send(record);
    }

    /// Submits a certificate-expiry change; retried until accepted.
    pub fn report_certificate(
        &self,
        monitor_id: MonitorId,
        host_scheme_id: HostSchemeId,
        expiration_timestamp: u64,
    ) {
        certs::spawn_reporter(
            self.outbound.clone(),
            self.shutdown.clone(),
            monitor_id,
            host_scheme_id,
            expiration_timestamp,
        );
    }

    /// Triggers an immediate latency report, empty or not, so status
    /// transitions reach the controller promptly.
    pub fn send_report(&self) {
        let _ = self.trigger_tx.send(Trigger::FlushNow);
    }

    fn take_pending(&self) -> Vec<LatencyEntry> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Builds the packed binary report: a 64-byte header followed by one
    /// 12-byte record per entry, all little-endian.
    fn build_report(&self, entries: &[LatencyEntry]) -> Vec<u8> {
        let mut message = Vec::with_capacity(HEADER_LENGTH + entries.len() * 12);

        let monitors_per_second = self.telemetry.monitors_per_second();
        let cpu = (resources::cpu_utilization() * 4096.0) as u64;
        let memory = (resources::memory_utilization() * 65536.0) as u64;

        message.extend_from_slice(&0u16.to_le_bytes()); // version
        match self.identifier.read() {
            Ok(identifier) => message.extend_from_slice(&*identifier),
            Err(_) => message.extend_from_slice(&[0; MAXIMUM_IDENTIFIER_LENGTH]),
        }
        message.extend_from_slice(&((monitors_per_second * 256.0) as u32).to_le_bytes());
        message.extend_from_slice(&(cpu.min(65_535) as u16).to_le_bytes());
        message.extend_from_slice(&(memory.min(65_535) as u16).to_le_bytes());
        message.push(self.telemetry.status().code());
        message.resize(HEADER_LENGTH, 0);

        for entry in entries {
            message.extend_from_slice(&entry.monitor_id.to_le_bytes());
            message.extend_from_slice(&zoran_timestamp(entry.unix_timestamp).to_le_bytes());
            message.extend_from_slice(&entry.latency_microseconds.to_le_bytes());
        }

        message
    }
}

async fn latency_loop(
    aggregator: Arc<DataAggregator>,
    mut trigger_rx: mpsc::UnboundedReceiver<Trigger>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            trigger = trigger_rx.recv() => {
                let Some(trigger) = trigger else { break };
                match trigger {
                    Trigger::FlushNow => {
                        if !flush(&aggregator, &mut shutdown).await {
                            break;
                        }
                        drain_triggers(&mut trigger_rx);
                        deadline = rearm(&aggregator);
                    }
                    Trigger::Poke if deadline.is_none() => {
                        if aggregator.pending_len() >= MAXIMUM_PENDING_ENTRIES {
                            if !flush(&aggregator, &mut shutdown).await {
                                break;
                            }
                            drain_triggers(&mut trigger_rx);
                            deadline = rearm(&aggregator);
                        } else {
                            deadline = Some(Instant::now() + REPORT_DELAY);
                        }
                    }
                    Trigger::Poke => {}
                }
            }
            _ = conditional_sleep(deadline), if deadline.is_some() => {
                if !flush(&aggregator, &mut shutdown).await {
                    break;
                }
                drain_triggers(&mut trigger_rx);
                deadline = rearm(&aggregator);
            }
        }
    }
}

async fn conditional_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Triggers queued while a report was in flight are stale; the rearm step
/// reads the pending list directly.
fn drain_triggers(trigger_rx: &mut mpsc::UnboundedReceiver<Trigger>) {
    while trigger_rx.try_recv().is_ok() {}
}

fn rearm(aggregator: &DataAggregator) -> Option<Instant> {
    let pending = aggregator.pending_len();
    if pending >= MAXIMUM_PENDING_ENTRIES {
        Some(Instant::now())
    } else if pending > 0 {
        Some(Instant::now() + REPORT_DELAY)
    } else {
        None
    }
}

/// Sends one report, retrying the same in-flight list until the controller
/// accepts it. Returns false when shutdown interrupted the retry loop.
async fn flush(aggregator: &Arc<DataAggregator>, shutdown: &mut watch::Receiver<()>) -> bool {
    let entries = aggregator.take_pending();

    loop {
        let report = aggregator.build_report(&entries);
        match aggregator.outbound.post_binary(LATENCY_RECORD_PATH, report).await {
            Ok(body) if is_accepted(&body) => {
                if entries.is_empty() {
                    info!("sent empty latency entry report");
                } else {
                    info!(
                        entries = entries.len(),
                        first = entries[0].unix_timestamp,
                        last = entries[entries.len() - 1].unix_timestamp,
                        "sent latency entries"
                    );
                }
                metrics::counter!("latency_entries_sent").increment(entries.len() as u64);
                return true;
            }
            Ok(body) => {
                warn!(
                    status = response_status(&body).unwrap_or("<missing>"),
                    retry_seconds = RETRY_DELAY.as_secs(),
                    "latency report rejected by controller, retrying"
                );
            }
            Err(error) => {
                warn!(
                    error = %error,
                    retry_seconds = RETRY_DELAY.as_secs(),
                    "latency report failed, retrying"
                );
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => return false,
            _ = sleep(RETRY_DELAY) => {}
        }
    }
}
