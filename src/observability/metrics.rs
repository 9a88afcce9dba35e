//! Metrics collection and exposition.
//!
//! # Metrics
//! - `netguard_connections_accepted_total` (counter)
//! - `netguard_accept_failures_total` (counter)
//! - `netguard_active_connections` (gauge)
//! - `netguard_read_failures_total` (counter): by `kind` (timeout, overflow, io)
//! - `netguard_write_failures_total` (counter)
//! - `netguard_denied_connections_total` (counter): by `standing`
//! - `netguard_busy_responses_total` (counter)
//! - `netguard_monitor_blocked_total` (counter): by `reason` (spam, erroneous)
//! - `netguard_monitor_tracked_ips` (gauge)
//! - `netguard_monitor_sweeps_total` (counter)
//! - `netguard_monitor_ips_removed_total` (counter)

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("netguard_connections_accepted_total").increment(1);
}

pub fn record_accept_failure() {
    counter!("netguard_accept_failures_total").increment(1);
}

pub fn set_active_connections(active: usize) {
    gauge!("netguard_active_connections").set(active as f64);
}

pub fn record_read_failure(kind: &'static str) {
    counter!("netguard_read_failures_total", "kind" => kind).increment(1);
}

pub fn record_write_failure() {
    counter!("netguard_write_failures_total").increment(1);
}

pub fn record_denied_connection(standing: &'static str) {
    counter!("netguard_denied_connections_total", "standing" => standing).increment(1);
}

pub fn record_busy_response() {
    counter!("netguard_busy_responses_total").increment(1);
}

/// An IP crossed a block threshold.
pub fn record_ip_blocked(reason: &'static str) {
    counter!("netguard_monitor_blocked_total", "reason" => reason).increment(1);
}

/// Outcome of one housekeeping sweep.
pub fn record_sweep(removed: usize, tracked: usize) {
    counter!("netguard_monitor_sweeps_total").increment(1);
    counter!("netguard_monitor_ips_removed_total").increment(removed as u64);
    gauge!("netguard_monitor_tracked_ips").set(tracked as f64);
}
