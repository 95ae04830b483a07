//! Allocator statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of cumulative allocator metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Successful allocations
    pub allocations: u64,
    /// Explicit releases
    pub releases: u64,
    /// Points reclaimed by background workers
    pub reclaimed: u64,
    /// Device points evicted back to host by pressure scans
    pub evicted: u64,
    /// Host-to-device transfers
    pub transfers_h2d: u64,
    /// Device-to-host transfers
    pub transfers_d2h: u64,
    /// Inline emergency sweeps forced by cap pressure
    pub forced_sweeps: u64,
    /// Host bytes currently in use
    pub host_bytes: u64,
    /// Device bytes currently in use across all devices
    pub device_bytes: u64,
    /// Points currently tracked
    pub tracked_points: usize,
}

/// Per-scan result counters for one reclamation pass
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanStats {
    /// Points examined
    pub checked: u64,
    /// Unreachable points freed and dropped from the table
    pub dropped: u64,
    /// Cold device points relocated back to host
    pub evicted: u64,
    /// Points that survived the scan
    pub survived: u64,
}

/// Internal atomic counters behind [`AllocatorStats`]
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) allocations: AtomicU64,
    pub(crate) releases: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) transfers_h2d: AtomicU64,
    pub(crate) transfers_d2h: AtomicU64,
    pub(crate) forced_sweeps: AtomicU64,
}

impl StatCounters {
    pub(crate) fn snapshot(
        &self,
        host_bytes: u64,
        device_bytes: u64,
        tracked_points: usize,
    ) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Acquire),
            releases: self.releases.load(Ordering::Acquire),
            reclaimed: self.reclaimed.load(Ordering::Acquire),
            evicted: self.evicted.load(Ordering::Acquire),
            transfers_h2d: self.transfers_h2d.load(Ordering::Acquire),
            transfers_d2h: self.transfers_d2h.load(Ordering::Acquire),
            forced_sweeps: self.forced_sweeps.load(Ordering::Acquire),
            host_bytes,
            device_bytes,
            tracked_points,
        }
    }
}
