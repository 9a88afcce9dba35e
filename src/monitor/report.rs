//! Read-only snapshots of monitor state.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use super::standing::IpStanding;

/// Aggregate view of the current monitor period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorMetrics {
    pub housekeeping_enabled: bool,
    pub frequency_minutes: u64,
    /// Milliseconds since the UNIX epoch.
    pub period_started_at: u64,
    pub spam_requests_block_threshold: u32,
    pub erroneous_requests_block_threshold: u32,
    pub tracked_ips: usize,
    pub new_ips_this_period: u32,
    pub temporarily_blocked_ips: usize,
    pub blacklisted_ips: usize,
    pub legitimate_requests: u64,
    pub erroneous_requests: u64,
    pub denied_requests: u64,
    /// IP with the most requests this period, if any made a request.
    pub busiest_ip: Option<IpAddr>,
    pub busiest_ip_requests: u32,
}

/// One blocked or blacklisted IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedIpMetrics {
    pub ip: IpAddr,
    pub standing_updated_at: u64,
    pub denied_requests: u32,
}

/// Everything tracked for a single IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpAddressMetrics {
    pub standing: IpStanding,
    pub standing_updated_at: u64,
    pub legitimate_requests: u32,
    pub erroneous_requests: u32,
    pub denied_requests: u32,
}

/// Result of one housekeeping sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub removed: usize,
    pub reinstated: usize,
    pub retained: usize,
    pub duration: Duration,
}
