// Tracing setup and transaction counters
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Calling it again once a subscriber is
/// installed is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Point-in-time copy of [`RequestorStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub resolved: u64,
    pub rejected_remote: u64,
    pub timed_out: u64,
    pub closed: u64,
    pub unmatched: u64,
}

impl StatsSnapshot {
    /// Transactions sent but not yet settled.
    pub fn in_flight(&self) -> u64 {
        self.sent
            .saturating_sub(self.resolved + self.rejected_remote + self.timed_out + self.closed)
    }
}

/// Per-requestor transaction counters
#[derive(Debug, Default)]
pub struct RequestorStats {
    sent: AtomicU64,
    resolved: AtomicU64,
    rejected_remote: AtomicU64,
    timed_out: AtomicU64,
    closed: AtomicU64,
    unmatched: AtomicU64,
}

impl RequestorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_remote(&self) {
        self.rejected_remote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self, count: u64) {
        self.closed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected_remote: self.rejected_remote.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}
