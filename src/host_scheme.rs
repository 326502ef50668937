//! A scheme+host grouping of monitors sharing TLS state and a ping target.
//!
//! Each timer tick hands the host/scheme one `service_next_monitor` call.
//! The round-robin cursor walks every monitor in id order; when the failing
//! set is non-empty a second cursor walks only the failing monitors, so
//! known-bad endpoints are probed at double rate without starving the rest.

use std::collections::{BTreeMap, BTreeSet};

use url::Url;

use crate::monitor::Monitor;
use crate::types::{HostSchemeId, MonitorId};

/// Stored TLS expiry meaning "not yet observed".
pub const UNKNOWN_SSL_EXPIRY: u64 = 0;

#[derive(Debug)]
pub struct HostScheme {
    pub id: HostSchemeId,
    /// Scheme + authority only; path, query, and fragment were stripped at
    /// ingest.
    pub url: Url,
    /// Last seen TLS certificate expiry (Unix seconds, 0 = unknown).
    pub ssl_expiration_timestamp: u64,
    monitors: BTreeMap<MonitorId, Monitor>,
    failing: BTreeSet<MonitorId>,
    round_robin_cursor: Option<MonitorId>,
    failing_cursor: Option<MonitorId>,
}

impl HostScheme {
    pub fn new(id: HostSchemeId, url: Url) -> Self {
        Self {
            id,
            url,
            ssl_expiration_timestamp: UNKNOWN_SSL_EXPIRY,
            monitors: BTreeMap::new(),
            failing: BTreeSet::new(),
            round_robin_cursor: None,
            failing_cursor: None,
        }
    }

    pub fn add_monitor(&mut self, monitor: Monitor) {
        self.monitors.insert(monitor.id, monitor);
    }

    pub fn remove_monitor(&mut self, monitor_id: MonitorId) -> Option<Monitor> {
        self.failing.remove(&monitor_id);
        self.monitors.remove(&monitor_id)
    }

    pub fn monitor(&self, monitor_id: MonitorId) -> Option<&Monitor> {
        self.monitors.get(&monitor_id)
    }

    pub fn monitor_mut(&mut self, monitor_id: MonitorId) -> Option<&mut Monitor> {
        self.monitors.get_mut(&monitor_id)
    }

    pub fn monitors(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.values()
    }

    pub fn monitor_ids(&self) -> impl Iterator<Item = MonitorId> + '_ {
        self.monitors.keys().copied()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Picks the monitors to probe for one timer tick: the next round-robin
    /// monitor, plus the next failing monitor when the failing set is
    /// non-empty and distinct from the first pick.
    pub fn service_next_monitor(&mut self) -> Vec<MonitorId> {
        let Some(primary) = Self::advance(&mut self.round_robin_cursor, self.monitors.keys().copied())
        else {
            return Vec::new();
        };

        let mut picks = vec![primary];
        if let Some(failing) = Self::advance(&mut self.failing_cursor, self.failing.iter().copied()) {
            if failing != primary {
                picks.push(failing);
            }
        }
        picks
    }

    /// Moves a monitor into the failing set.
    pub fn monitor_non_responsive(&mut self, monitor_id: MonitorId) {
        if self.monitors.contains_key(&monitor_id) {
            self.failing.insert(monitor_id);
        }
    }

    /// Removes a monitor from the failing set after recovery.
    pub fn monitor_now_responsive(&mut self, monitor_id: MonitorId) {
        self.failing.remove(&monitor_id);
    }

    pub fn failing_count(&self) -> usize {
        self.failing.len()
    }

    pub fn is_failing(&self, monitor_id: MonitorId) -> bool {
        self.failing.contains(&monitor_id)
    }

    /// Wrap-around scan: yields the first id >= cursor, or the smallest id
    /// when the cursor ran past the end, then parks the cursor just after
    /// the pick. Removed ids are skipped naturally.
    fn advance(
        cursor: &mut Option<MonitorId>,
        ids: impl Iterator<Item = MonitorId> + Clone,
    ) -> Option<MonitorId> {
        let start = cursor.unwrap_or(0);
        let pick = ids
            .clone()
            .find(|&id| id >= start)
            .or_else(|| ids.clone().next())?;
        *cursor = pick.checked_add(1).or(Some(0));
        Some(pick)
    }
}
