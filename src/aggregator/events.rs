//! Ordered anomaly-event reporting.
//!
//! Events form a FIFO with exactly one message in flight: the head is posted
//! and retried every 60 seconds until the controller accepts it, then the
//! next goes out. This preserves per-monitor event ordering end to end.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use super::RETRY_DELAY;
use crate::monitor::MonitorStatus;
use crate::outbound::{is_accepted, response_status, OutboundClient};
use crate::types::MonitorId;

pub const EVENT_REPORT_PATH: &str = "/event/report";

/// Kind of anomaly being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Working,
    NoResponse,
    ContentChanged,
    Keywords,
    SslCertificate,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Working => "working",
            EventType::NoResponse => "no_response",
            EventType::ContentChanged => "content_changed",
            EventType::Keywords => "keywords",
            EventType::SslCertificate => "ssl_certificate",
        }
    }
}

/// A single event ready to be sent.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub monitor_id: MonitorId,
    pub timestamp: u64,
    pub event_type: EventType,
    /// Monitor status at the moment the event was observed.
    pub monitor_status: MonitorStatus,
    pub message: String,
    /// Content digest, when the event carries one; blocks repeat reports of
    /// identical findings on the controller side.
    pub hash: Option<Vec<u8>>,
}

impl EventRecord {
    fn to_json(&self) -> Value {
        let mut body = json!({
            "monitor_id": self.monitor_id,
            "timestamp": self.timestamp,
            "event_type": self.event_type.as_str(),
            "monitor_status": self.monitor_status.as_str(),
            "message": self.message,
        });
        if let Some(hash) = &self.hash {
            body["hash"] = Value::String(BASE64.encode(hash));
        }
        body
    }
}

/// Drains the event queue, one in-flight message at a time.
pub(super) async fn run(
    mut events_rx: mpsc::UnboundedReceiver<EventRecord>,
    outbound: Arc<OutboundClient>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            record = events_rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if !send_with_retry(&record, &outbound, &mut shutdown).await {
            break;
        }
    }
}

/// Posts one event until accepted. Returns false when shutdown interrupted.
async fn send_with_retry(
    record: &EventRecord,
    outbound: &OutboundClient,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    let body = record.to_json();

    loop {
        match outbound.post_json(EVENT_REPORT_PATH, &body).await {
            Ok(response) if is_accepted(&response) => {
                info!(
                    event = record.event_type.as_str(),
                    monitor_id = record.monitor_id,
                    timestamp = record.timestamp,
                    status = record.monitor_status.as_str(),
                    message = %record.message,
                    "sent event"
                );
                metrics::counter!("events_sent").increment(1);
                return true;
            }
            Ok(response) => {
                warn!(
                    event = record.event_type.as_str(),
                    monitor_id = record.monitor_id,
                    reported = response_status(&response).unwrap_or("<missing>"),
                    retry_seconds = RETRY_DELAY.as_secs(),
                    "controller rejected event, retrying"
                );
            }
            Err(error) => {
                warn!(
                    event = record.event_type.as_str(),
                    monitor_id = record.monitor_id,
                    error = %error,
                    retry_seconds = RETRY_DELAY.as_secs(),
                    "failed to send event, retrying"
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
