//! Connection and request accounting for the service.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::monitor::now_ms;

/// Active connection count with its high-water mark.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    peak_at: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. Returns the new active count.
    pub fn increment(&self) -> usize {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;

        let mut peak = self.peak.load(Ordering::SeqCst);
        while active > peak {
            match self
                .peak
                .compare_exchange_weak(peak, active, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.peak_at.store(now_ms(), Ordering::SeqCst);
                    break;
                }
                Err(current) => peak = current,
            }
        }
        active
    }

    /// Count a finished connection. Never goes below zero. Returns the new count.
    pub fn decrement(&self) -> usize {
        match self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// When the peak was reached, in ms since the UNIX epoch. Zero if never.
    pub fn peak_at(&self) -> u64 {
        self.peak_at.load(Ordering::SeqCst)
    }

    pub fn reset_active(&self) {
        self.active.store(0, Ordering::SeqCst);
    }
}

/// Running totals since the service started.
#[derive(Debug, Default)]
pub struct RequestCounters {
    pub(crate) legitimate: AtomicU64,
    pub(crate) legitimate_request_bytes: AtomicU64,
    pub(crate) legitimate_response_bytes: AtomicU64,
    pub(crate) largest_request: AtomicUsize,
    pub(crate) largest_response: AtomicUsize,
    pub(crate) erroneous: AtomicU64,
    pub(crate) read_timeouts: AtomicU64,
    pub(crate) read_overflows: AtomicU64,
    pub(crate) read_failures: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) denied: AtomicU64,
    pub(crate) busy: AtomicU64,
}

impl RequestCounters {
    pub(crate) fn record_legitimate(&self, request_size: usize, response_size: usize) {
        self.legitimate.fetch_add(1, Ordering::Relaxed);
        self.legitimate_request_bytes
            .fetch_add(request_size as u64, Ordering::Relaxed);
        self.legitimate_response_bytes
            .fetch_add(response_size as u64, Ordering::Relaxed);
        self.largest_request.fetch_max(request_size, Ordering::Relaxed);
        self.largest_response.fetch_max(response_size, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn peak_follows_high_water_mark() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.peak_at(), 0);
        tracker.increment();
        tracker.increment();
        tracker.decrement();
        tracker.increment();
        assert_eq!(tracker.active(), 2);
        assert_eq!(tracker.peak(), 2);
        assert!(tracker.peak_at() > 0);
    }

    #[test]
    fn decrement_saturates() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.decrement(), 0);
        tracker.increment();
        tracker.reset_active();
        assert_eq!(tracker.decrement(), 0);
        assert_eq!(tracker.peak(), 1);
    }

    #[test]
    fn concurrent_peak() {
        let tracker = Arc::new(ConnectionTracker::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.increment();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tracker.peak(), 800);
    }

    #[test]
    fn legitimate_sizes() {
        let counters = RequestCounters::default();
        counters.record_legitimate(10, 100);
        counters.record_legitimate(30, 20);
        assert_eq!(RequestCounters::get(&counters.legitimate), 2);
        assert_eq!(counters.largest_request.load(Ordering::Relaxed), 30);
        assert_eq!(counters.largest_response.load(Ordering::Relaxed), 100);
        assert_eq!(RequestCounters::get(&counters.legitimate_request_bytes), 40);
    }
}
