//! Monitor period state and the periodic sweep task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::IpAddressRequestMonitor;
use crate::lifecycle::Shutdown;

/// Start of the current monitor period. Guarded by the housekeeping lock.
#[derive(Debug)]
pub(crate) struct MonitorPeriod {
    pub(crate) started_at: u64,
}

pub(crate) struct Runner {
    pub(crate) shutdown: Shutdown,
    pub(crate) handle: JoinHandle<()>,
}

/// Housekeeping state shared by sweeps, snapshots and the scheduler.
///
/// `period` is the housekeeping lock: sweeps and metrics snapshots hold it,
/// request reports never do. The new-IP counter lives outside it so reporters
/// can bump it while a sweep holds map shards.
pub(crate) struct Housekeeping {
    pub(crate) period: Mutex<MonitorPeriod>,
    new_ips: AtomicU32,
    pub(crate) runner: Mutex<Option<Runner>>,
}

impl Housekeeping {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            period: Mutex::new(MonitorPeriod { started_at: now_ms }),
            new_ips: AtomicU32::new(0),
            runner: Mutex::new(None),
        }
    }

    pub(crate) fn report_new_ip(&self) {
        self.new_ips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn new_ips(&self) -> u32 {
        self.new_ips.load(Ordering::Relaxed)
    }

    /// Begin a new period. Caller holds the period lock.
    pub(crate) fn reset_period(&self, period: &mut MonitorPeriod, now_ms: u64) {
        period.started_at = now_ms;
        self.new_ips.store(0, Ordering::Relaxed);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.runner.lock().is_some()
    }
}

/// Sweep every `every`, first firing one full period after start.
///
/// Each sweep runs on the blocking pool; it locks every map shard in turn and
/// must not hold up connection tasks sharing this runtime.
pub(crate) async fn run(
    monitor: Weak<IpAddressRequestMonitor>,
    every: Duration,
    mut stop: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_secs = every.as_secs(), "Monitor housekeeping started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                if let Err(error) = task::spawn_blocking(move || monitor.run_housekeeping()).await {
                    tracing::error!(error = %error, "Monitor housekeeping sweep failed");
                }
            }
            _ = stop.recv() => break,
        }
    }

    tracing::info!("Monitor housekeeping stopped");
}
