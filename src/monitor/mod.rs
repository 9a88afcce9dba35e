//! Per-IP request monitoring and blocking.
//!
//! # Data Flow
//! ```text
//! connection service
//!     → report_{legitimate,erroneous,denied}_request(ip)
//!     → node.rs (counts and standing, one mutex per IP)
//!
//! housekeeping.rs (every period)
//!     → sweep: drop quiet IPs, reinstate quiet blocked IPs, reset counts
//!
//! checkpoint.rs
//!     → blocked and blacklisted IPs survive restarts
//! ```
//!
//! # Design Decisions
//! - Nodes live in a sharded `DashMap`; reporters clone the node's `Arc`, drop
//!   the shard guard, then lock the node. Lock order is always
//!   period → shard → node.
//! - A node removed by a sweep is tombstoned under its own lock; a reporter that
//!   finds a tombstone looks the IP up again rather than updating a node that
//!   is no longer in the map
//! - Blacklisting is sticky. Only an explicit parole lifts it.

pub mod checkpoint;
mod housekeeping;
mod node;
pub mod report;
pub mod standing;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::config::MonitorConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

pub use checkpoint::{CheckpointError, CheckpointRecord, CHECKPOINT_FILE_NAME};
pub use report::{BlockedIpMetrics, IpAddressMetrics, MonitorMetrics, SweepSummary};
pub use standing::IpStanding;

use housekeeping::{Housekeeping, Runner};
use node::{PeriodOutcome, RequestNode, SharedNode};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("cannot restore a checkpoint while housekeeping is running")]
    HousekeepingActive,
    #[error("housekeeping is already running")]
    HousekeepingAlreadyStarted,
    #[error("housekeeping interval must be greater than zero")]
    InvalidInterval,
    #[error("housekeeping needs a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Tracks requests per source IP and decides each IP's standing.
pub struct IpAddressRequestMonitor {
    frequency_minutes: u64,
    housekeeping_interval: Duration,
    spam_threshold: u32,
    erroneous_threshold: u32,
    nodes: DashMap<IpAddr, SharedNode>,
    housekeeping: Housekeeping,
}

impl IpAddressRequestMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        let shards = config.concurrency.max(2).next_power_of_two();
        Self {
            frequency_minutes: config.frequency_minutes,
            housekeeping_interval: config.frequency(),
            spam_threshold: config.spam_requests_block_threshold.max(1),
            erroneous_threshold: config.erroneous_requests_block_threshold.max(1),
            nodes: DashMap::with_capacity_and_shard_amount(config.initial_capacity, shards),
            housekeeping: Housekeeping::new(now_ms()),
        }
    }

    /// Override the sweep interval derived from `frequency_minutes`.
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn spam_requests_block_threshold(&self) -> u32 {
        self.spam_threshold
    }

    pub fn erroneous_requests_block_threshold(&self) -> u32 {
        self.erroneous_threshold
    }

    /// Number of IPs currently tracked.
    pub fn tracked_ips(&self) -> usize {
        self.nodes.len()
    }

    pub fn standing(&self, ip: IpAddr) -> IpStanding {
        match self.existing_node(ip) {
            Some(node) => node.lock().standing(),
            None => IpStanding::Ok,
        }
    }

    pub fn report_legitimate_request(&self, ip: IpAddr) {
        let threshold = self.spam_threshold;
        if self.with_live_node(ip, |node| node.record_legitimate(threshold, now_ms())) {
            tracing::warn!(ip = %ip, threshold, "IP temporarily blocked for request volume");
            metrics::record_ip_blocked("spam");
        }
    }

    pub fn report_erroneous_request(&self, ip: IpAddr) {
        let threshold = self.erroneous_threshold;
        if self.with_live_node(ip, |node| node.record_erroneous(threshold, now_ms())) {
            tracing::warn!(ip = %ip, threshold, "IP temporarily blocked for erroneous requests");
            metrics::record_ip_blocked("erroneous");
        }
    }

    pub fn report_denied_request(&self, ip: IpAddr) {
        self.with_live_node(ip, RequestNode::record_denied);
    }

    pub fn set_blacklisted(&self, ip: IpAddr) {
        self.with_live_node(ip, |node| node.set_standing(IpStanding::Blacklisted, now_ms()));
        tracing::info!(ip = %ip, "IP blacklisted");
    }

    /// Lift a block. The new standing depends on this period's request count:
    /// an IP still at or above the spam threshold stays temporarily blocked.
    ///
    /// Returns `None` for an IP that is not tracked.
    pub fn set_paroled(&self, ip: IpAddr) -> Option<IpStanding> {
        let node = self.existing_node(ip)?;
        // A tombstoned node is not re-checked: a removed IP is effectively Ok.
        let standing = node.lock().parole(self.spam_threshold, now_ms());
        tracing::info!(ip = %ip, standing = %standing, "IP paroled");
        Some(standing)
    }

    /// Run one sweep now, closing the current monitor period.
    ///
    /// Quiet OK IPs are dropped, quiet temporarily blocked IPs are reinstated,
    /// and every surviving IP starts the new period with zero counts.
    pub fn run_housekeeping(&self) -> SweepSummary {
        let started = std::time::Instant::now();
        let mut period = self.housekeeping.period.lock();
        let now = now_ms();
        let mut summary = SweepSummary::default();

        self.nodes
            .retain(|_, node| match node.lock().end_period(self.spam_threshold, now) {
                PeriodOutcome::Remove => {
                    summary.removed += 1;
                    false
                }
                PeriodOutcome::Reinstated => {
                    summary.reinstated += 1;
                    summary.retained += 1;
                    true
                }
                PeriodOutcome::Retained => {
                    summary.retained += 1;
                    true
                }
            });

        self.housekeeping.reset_period(&mut period, now_ms());
        drop(period);
        summary.duration = started.elapsed();

        tracing::info!(
            removed = summary.removed,
            reinstated = summary.reinstated,
            retained = summary.retained,
            duration_ms = summary.duration.as_millis() as u64,
            "Monitor housekeeping sweep complete"
        );
        metrics::record_sweep(summary.removed, summary.retained);
        summary
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The first sweep runs one full interval after this call. Sweeps execute
    /// on the runtime's blocking pool, off the I/O workers.
    pub fn start_housekeeping(self: &Arc<Self>) -> Result<(), MonitorError> {
        if self.housekeeping_interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }
        let handle = Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;

        let mut runner = self.housekeeping.runner.lock();
        if runner.is_some() {
            return Err(MonitorError::HousekeepingAlreadyStarted);
        }

        let shutdown = Shutdown::new();
        let task = housekeeping::run(
            Arc::downgrade(self),
            self.housekeeping_interval,
            shutdown.subscribe(),
        );
        *runner = Some(Runner {
            shutdown,
            handle: handle.spawn(task),
        });
        Ok(())
    }

    /// Stop the periodic sweep and wait for it to exit.
    ///
    /// Returns false if housekeeping was not running.
    pub async fn shutdown_housekeeping(&self) -> bool {
        let runner = self.housekeeping.runner.lock().take();
        let Some(runner) = runner else {
            return false;
        };

        runner.shutdown.trigger();
        if let Err(error) = runner.handle.await {
            if !error.is_cancelled() {
                tracing::error!(error = %error, "Monitor housekeeping task failed");
            }
        }
        true
    }

    pub fn is_housekeeping_started(&self) -> bool {
        self.housekeeping.is_started()
    }

    /// Start of the current monitor period, in ms since the UNIX epoch.
    pub fn monitor_period_start(&self) -> u64 {
        self.housekeeping.period.lock().started_at
    }

    /// Snapshot of the current period, consistent with respect to sweeps.
    pub fn metrics(&self) -> MonitorMetrics {
        let period = self.housekeeping.period.lock();

        let mut snapshot = MonitorMetrics {
            housekeeping_enabled: self.is_housekeeping_started(),
            frequency_minutes: self.frequency_minutes,
            period_started_at: period.started_at,
            spam_requests_block_threshold: self.spam_threshold,
            erroneous_requests_block_threshold: self.erroneous_threshold,
            tracked_ips: 0,
            new_ips_this_period: self.housekeeping.new_ips(),
            temporarily_blocked_ips: 0,
            blacklisted_ips: 0,
            legitimate_requests: 0,
            erroneous_requests: 0,
            denied_requests: 0,
            busiest_ip: None,
            busiest_ip_requests: 0,
        };

        for entry in self.nodes.iter() {
            let node = entry.value().lock();
            snapshot.tracked_ips += 1;

            let total = node.total_requests();
            if total > snapshot.busiest_ip_requests {
                snapshot.busiest_ip_requests = total;
                snapshot.busiest_ip = Some(*entry.key());
            }

            snapshot.legitimate_requests += u64::from(node.legitimate());
            snapshot.erroneous_requests += u64::from(node.erroneous());
            snapshot.denied_requests += u64::from(node.denied());

            match node.standing() {
                IpStanding::Ok => {}
                IpStanding::TemporarilyBlocked => snapshot.temporarily_blocked_ips += 1,
                IpStanding::Blacklisted => snapshot.blacklisted_ips += 1,
            }
        }

        snapshot
    }

    pub fn temporarily_blocked_metrics(&self) -> Vec<BlockedIpMetrics> {
        self.blocked_metrics(IpStanding::TemporarilyBlocked)
    }

    pub fn blacklisted_metrics(&self) -> Vec<BlockedIpMetrics> {
        self.blocked_metrics(IpStanding::Blacklisted)
    }

    fn blocked_metrics(&self, target: IpStanding) -> Vec<BlockedIpMetrics> {
        self.nodes
            .iter()
            .filter_map(|entry| {
                let node = entry.value().lock();
                (node.standing() == target).then(|| BlockedIpMetrics {
                    ip: *entry.key(),
                    standing_updated_at: node.standing_updated_at(),
                    denied_requests: node.denied(),
                })
            })
            .collect()
    }

    pub fn ip_metrics(&self, ip: IpAddr) -> Option<IpAddressMetrics> {
        let node = self.existing_node(ip)?;
        let node = node.lock();
        Some(IpAddressMetrics {
            standing: node.standing(),
            standing_updated_at: node.standing_updated_at(),
            legitimate_requests: node.legitimate(),
            erroneous_requests: node.erroneous(),
            denied_requests: node.denied(),
        })
    }

    /// Persist every non-OK IP to `dir`. Returns the number of records written.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<usize, MonitorError> {
        let records: Vec<CheckpointRecord> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                let node = entry.value().lock();
                node.standing().is_blocked().then(|| CheckpointRecord {
                    ip: *entry.key(),
                    standing: node.standing(),
                    standing_updated_at: node.standing_updated_at(),
                })
            })
            .collect();

        let path = checkpoint::write_file(dir, &records)?;
        tracing::info!(path = %path.display(), records = records.len(), "Monitor checkpoint saved");
        Ok(records.len())
    }

    /// Replace all tracked state with the checkpoint in `dir`.
    ///
    /// The file is fully decoded before anything is cleared, so a corrupt
    /// checkpoint leaves the monitor untouched. Returns the number of IPs
    /// restored.
    pub fn restore_from_checkpoint(&self, dir: &Path) -> Result<usize, MonitorError> {
        if self.is_housekeeping_started() {
            return Err(MonitorError::HousekeepingActive);
        }
        let records = checkpoint::read_file(dir)?;

        let mut period = self.housekeeping.period.lock();
        self.nodes.retain(|_, node| {
            node.lock().mark_deleted();
            false
        });
        self.housekeeping.reset_period(&mut period, now_ms());

        let mut restored = 0;
        for record in records.iter().filter(|record| record.standing.is_blocked()) {
            let node = RequestNode::restored(record.standing, record.standing_updated_at).shared();
            if let Some(previous) = self.nodes.insert(record.ip, node) {
                previous.lock().mark_deleted();
            }
            restored += 1;
        }
        drop(period);

        tracing::info!(restored, "Monitor restored from checkpoint");
        Ok(restored)
    }

    fn existing_node(&self, ip: IpAddr) -> Option<SharedNode> {
        self.nodes.get(&ip).map(|entry| Arc::clone(entry.value()))
    }

    fn node_for(&self, ip: IpAddr) -> SharedNode {
        if let Some(node) = self.existing_node(ip) {
            return node;
        }

        let (node, created) = match self.nodes.entry(ip) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let node = RequestNode::new(now_ms()).shared();
                entry.insert(Arc::clone(&node));
                (node, true)
            }
        };
        // Counted outside the shard lock; a sweep may be holding others.
        if created {
            self.housekeeping.report_new_ip();
        }
        node
    }

    /// Apply `update` to the IP's live node, retrying past tombstones.
    fn with_live_node<R>(&self, ip: IpAddr, mut update: impl FnMut(&mut RequestNode) -> R) -> R {
        loop {
            let node = self.node_for(ip);
            let mut guard = node.lock();
            if guard.is_deleted() {
                continue;
            }
            return update(&mut *guard);
        }
    }
}

impl std::fmt::Debug for IpAddressRequestMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpAddressRequestMonitor")
            .field("tracked_ips", &self.nodes.len())
            .field("spam_threshold", &self.spam_threshold)
            .field("erroneous_threshold", &self.erroneous_threshold)
            .field("housekeeping_interval", &self.housekeeping_interval)
            .finish()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
