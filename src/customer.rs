//! Customer container: capability flags, polling interval, and the owned
//! host/schemes.

use std::collections::BTreeMap;

use crate::host_scheme::HostScheme;
use crate::types::{CustomerId, HostSchemeId};

/// Smallest polling interval the inbound API accepts, in seconds.
pub const MINIMUM_POLLING_INTERVAL: u32 = 20;

#[derive(Debug)]
pub struct Customer {
    pub id: CustomerId,
    pub supports_ping_testing: bool,
    pub supports_ssl_expiration_checking: bool,
    pub supports_latency_measurements: bool,
    pub supports_multi_region_testing: bool,
    /// Never changes after admission; reconfiguration is remove + re-add.
    pub polling_interval: u32,
    pub paused: bool,
    host_schemes: BTreeMap<HostSchemeId, HostScheme>,
}

impl Customer {
    pub fn new(
        id: CustomerId,
        supports_ping_testing: bool,
        supports_ssl_expiration_checking: bool,
        supports_latency_measurements: bool,
        supports_multi_region_testing: bool,
        polling_interval: u32,
    ) -> Self {
        Self {
            id,
            supports_ping_testing,
            supports_ssl_expiration_checking,
            supports_latency_measurements,
            supports_multi_region_testing,
            polling_interval,
            paused: false,
            host_schemes: BTreeMap::new(),
        }
    }

    /// Signed timer key: positive intervals are multi-region, negative ones
    /// single-region.
    pub fn signed_polling_interval(&self) -> i64 {
        if self.supports_multi_region_testing {
            i64::from(self.polling_interval)
        } else {
            -i64::from(self.polling_interval)
        }
    }

    pub fn add_host_scheme(&mut self, host_scheme: HostScheme) {
        self.host_schemes.insert(host_scheme.id, host_scheme);
    }

    pub fn remove_host_scheme(&mut self, host_scheme_id: HostSchemeId) -> Option<HostScheme> {
        self.host_schemes.remove(&host_scheme_id)
    }

    pub fn host_scheme(&self, host_scheme_id: HostSchemeId) -> Option<&HostScheme> {
        self.host_schemes.get(&host_scheme_id)
    }

    pub fn host_scheme_mut(&mut self, host_scheme_id: HostSchemeId) -> Option<&mut HostScheme> {
        self.host_schemes.get_mut(&host_scheme_id)
    }

    pub fn host_schemes(&self) -> impl Iterator<Item = &HostScheme> {
        self.host_schemes.values()
    }

    pub fn host_schemes_mut(&mut self) -> impl Iterator<Item = &mut HostScheme> {
        self.host_schemes.values_mut()
    }

    pub fn host_scheme_count(&self) -> usize {
        self.host_schemes.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.host_schemes.values().map(HostScheme::monitor_count).sum()
    }
}
