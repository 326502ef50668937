//! Fire-and-forget certificate-expiry reporting.
//!
//! Each observed expiry change spawns its own reporter task bound to the
//! `(monitor, host/scheme, expiry)` triple; the task retries until the
//! controller accepts and then ends. Producers never wait on it.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use super::RETRY_DELAY;
use crate::outbound::{is_accepted, response_status, OutboundClient};
use crate::types::{HostSchemeId, MonitorId};

pub const CERTIFICATE_REPORT_PATH: &str = "/host_scheme/certificate";

pub(super) fn spawn_reporter(
    outbound: Arc<OutboundClient>,
    mut shutdown: watch::Receiver<()>,
    monitor_id: MonitorId,
    host_scheme_id: HostSchemeId,
    expiration_timestamp: u64,
) {
    tokio::spawn(async move {
        let body = json!({
            "monitor_id": monitor_id,
            "host_scheme_id": host_scheme_id,
            "expiration_timestamp": expiration_timestamp,
        });

        loop {
            match outbound.post_json(CERTIFICATE_REPORT_PATH, &body).await {
                Ok(response) if is_accepted(&response) => {
                    info!(
                        monitor_id,
                        host_scheme_id, expiration_timestamp, "sent certificate data"
                    );
                    return;
                }
                Ok(response) => {
                    warn!(
                        monitor_id,
                        host_scheme_id,
                        reported = response_status(&response).unwrap_or("<missing>"),
                        retry_seconds = RETRY_DELAY.as_secs(),
                        "controller rejected certificate data, retrying"
                    );
                }
                Err(error) => {
                    warn!(
                        monitor_id,
                        host_scheme_id,
                        error = %error,
                        retry_seconds = RETRY_DELAY.as_secs(),
                        "failed to send certificate data, retrying"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = sleep(RETRY_DELAY) => {}
            }
        }
    });
}
