//! Shared identifiers and small value types.

use serde::Serialize;

/// Identifier of a single monitor. Zero is reserved as "invalid".
pub type MonitorId = u32;

/// Identifier of a scheme+host grouping. Zero is reserved as "invalid".
pub type HostSchemeId = u32;

/// Identifier of a customer. Zero is reserved as "invalid".
pub type CustomerId = u32;

/// Unix-seconds origin of the 32-bit "Zoran" timestamps used in the binary
/// latency records (2021-01-01T00:00:00 local to the original deployment).
pub const ZORAN_EPOCH_OFFSET: u64 = 1_609_484_400;

/// Converts a Unix timestamp to Zoran time, saturating below the epoch.
pub fn zoran_timestamp(unix_seconds: u64) -> u32 {
    unix_seconds.saturating_sub(ZORAN_EPOCH_OFFSET) as u32
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Overall server state as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Unknown,
    Active,
    Inactive,
    Defunct,
}

impl ServerStatus {
    /// Wire code used in the binary latency report header.
    pub fn code(self) -> u8 {
        match self {
            ServerStatus::Unknown => 0,
            ServerStatus::Active => 1,
            ServerStatus::Inactive => 2,
            ServerStatus::Defunct => 3,
        }
    }

    pub fn from_code(code: u8) -> ServerStatus {
        match code {
            1 => ServerStatus::Active,
            2 => ServerStatus::Inactive,
            3 => ServerStatus::Defunct,
            _ => ServerStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Unknown => "UNKNOWN",
            ServerStatus::Active => "ACTIVE",
            ServerStatus::Inactive => "INACTIVE",
            ServerStatus::Defunct => "DEFUNCT",
        }
    }
}

/// Immutable snapshot of a timer's recent scheduling health.
///
/// Republished by each host/scheme timer at a fixed cadence and exposed to
/// the controller through `/loading/get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadingData {
    /// Number of host/schemes the timer was servicing at snapshot time.
    pub polled_host_schemes: u64,
    /// Timing windows missed by more than a millisecond since the last reset.
    pub missed_timing_windows: u64,
    /// Average miss, in seconds; zero when too little data was collected.
    pub average_miss_seconds: f64,
}

impl LoadingData {
    pub fn new(polled: u64, missed: u64, average_miss_seconds: f64) -> Self {
        Self {
            polled_host_schemes: polled,
            missed_timing_windows: missed,
            average_miss_seconds,
        }
    }
}
