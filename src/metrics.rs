//! Coordinator Metrics
//!
//! Lock-free counters for the read fallback chain and best-effort writes.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the cache coordinator
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Network answered
    pub fresh: AtomicU64,
    /// Database answered after the network failed
    pub database_hits: AtomicU64,
    /// Backup store answered after the database missed
    pub backup_hits: AtomicU64,
    /// Cache answers that were past their TTL
    pub stale_served: AtomicU64,
    /// Every tier missed
    pub offline: AtomicU64,
    /// Network attempts that failed or timed out
    pub network_failures: AtomicU64,
    /// Network attempts skipped because the client is known offline
    pub network_skipped: AtomicU64,
    /// Best-effort writes that failed on every tier
    pub write_failures: AtomicU64,
    /// Writes that landed in the backup store
    pub backup_writes: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Total reads answered by any tier
    pub fn total_reads(&self) -> u64 {
        self.fresh.load(Ordering::Relaxed)
            + self.database_hits.load(Ordering::Relaxed)
            + self.backup_hits.load(Ordering::Relaxed)
            + self.offline.load(Ordering::Relaxed)
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            fresh: self.fresh.load(Ordering::Relaxed),
            database_hits: self.database_hits.load(Ordering::Relaxed),
            backup_hits: self.backup_hits.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            network_skipped: self.network_skipped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            backup_writes: self.backup_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of coordinator metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorMetricsSnapshot {
    pub fresh: u64,
    pub database_hits: u64,
    pub backup_hits: u64,
    pub stale_served: u64,
    pub offline: u64,
    pub network_failures: u64,
    pub network_skipped: u64,
    pub write_failures: u64,
    pub backup_writes: u64,
}

impl CoordinatorMetricsSnapshot {
    /// Share of reads answered from a cache tier (0.0 to 1.0)
    pub fn cache_ratio(&self) -> f64 {
        let total = self.fresh + self.database_hits + self.backup_hits + self.offline;
        if total == 0 {
            0.0
        } else {
            (self.database_hits + self.backup_hits) as f64 / total as f64
        }
    }
}
