//! Lightweight connection counters exposed via [`crate::manager::ConnectionManager::stats`].
//! Not named in the distilled spec; supplemented because a long-running manager needs some way to
//! observe admission/rejection/eviction behavior without wiring up a full metrics stack.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    inbound_accepted: AtomicU64,
    outbound_connected: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    virtual_connects_succeeded: AtomicU64,
    virtual_connects_failed: AtomicU64,
}

impl Stats {
    pub fn record_inbound_accepted(&self) {
        self.inbound_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_connected(&self) {
        self.outbound_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_virtual_connect_succeeded(&self) {
        self.virtual_connects_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_virtual_connect_failed(&self) {
        self.virtual_connects_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inbound_accepted: self.inbound_accepted.load(Ordering::Relaxed),
            outbound_connected: self.outbound_connected.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            virtual_connects_succeeded: self.virtual_connects_succeeded.load(Ordering::Relaxed),
            virtual_connects_failed: self.virtual_connects_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`], cheap to hand out to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inbound_accepted: u64,
    pub outbound_connected: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub virtual_connects_succeeded: u64,
    pub virtual_connects_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = Stats::default();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        stats.record_admitted();
        stats.record_admitted();
        stats.record_rejected();
        let snap = stats.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.rejected, 1);
    }
}
