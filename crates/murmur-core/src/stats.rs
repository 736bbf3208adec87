use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the outbox processor and store dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Processing cycles started
    pub cycles: AtomicU64,
    /// Cycles skipped because the network was down
    pub offline_cycles: AtomicU64,
    /// Emails that completed without error
    pub emails_sent: AtomicU64,
    /// Emails aborted by an error
    pub emails_failed: AtomicU64,
    /// Units stored in the DHT directly
    pub direct_stores: AtomicU64,
    /// Relay envelopes handed to the relay queue
    pub relay_envelopes: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            offline_cycles: self.offline_cycles.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            direct_stores: self.direct_stores.load(Ordering::Relaxed),
            relay_envelopes: self.relay_envelopes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub cycles: u64,
    pub offline_cycles: u64,
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub direct_stores: u64,
    pub relay_envelopes: u64,
}
