//! Buffer manager statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by the buffer manager.
///
/// All fields are atomic for lock-free, thread-safe updates.
///
/// # Memory Ordering
/// We use `Ordering::Relaxed` for all operations because:
/// - We only need atomicity (no partial updates)
/// - We don't need synchronization between different counters
/// - Statistics are "eventually consistent" - exact ordering doesn't matter
///
/// # Example
/// ```
/// use meshpool::BufferStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = BufferStats::new();
/// stats.local_hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.local_hits.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug)]
pub struct BufferStats {
    /// `fix` calls satisfied without any coherence traffic.
    pub local_hits: AtomicU64,
    /// `fix` calls that required a possession-request round trip.
    pub remote_fetches: AtomicU64,
    /// Pages evicted from DRAM by the page provider.
    pub evictions: AtomicU64,
    /// Pages spilled to the SSD tier on eviction.
    pub ssd_writes: AtomicU64,
    /// Pages read back from the SSD tier on fault-in.
    pub ssd_reads: AtomicU64,
    /// Possession requests that hit the retry cap and restarted.
    pub restarts: AtomicU64,
}

impl BufferStats {
    /// Create a new stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            local_hits: AtomicU64::new(0),
            remote_fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            ssd_writes: AtomicU64::new(0),
            ssd_reads: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// Fraction of `fix` calls satisfied without coherence traffic (0.0 to 1.0).
    pub fn local_hit_rate(&self) -> f64 {
        let hits = self.local_hits.load(Ordering::Relaxed);
        let remote = self.remote_fetches.load(Ordering::Relaxed);
        let total = hits + remote;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// A non-atomic copy for display/logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ssd_writes: self.ssd_writes.load(Ordering::Relaxed),
            ssd_reads: self.ssd_reads.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.local_hits.store(0, Ordering::Relaxed);
        self.remote_fetches.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.ssd_writes.store(0, Ordering::Relaxed);
        self.ssd_reads.store(0, Ordering::Relaxed);
        self.restarts.store(0, Ordering::Relaxed);
    }
}

impl Default for BufferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of buffer manager statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub local_hits: u64,
    pub remote_fetches: u64,
    pub evictions: u64,
    pub ssd_writes: u64,
    pub ssd_reads: u64,
    pub restarts: u64,
}

impl StatsSnapshot {
    pub fn local_hit_rate(&self) -> f64 {
        let total = self.local_hits + self.remote_fetches;
        if total == 0 {
            0.0
        } else {
            self.local_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ local_hits: {}, remote_fetches: {}, evictions: {}, local_hit_rate: {:.2}% }}",
            self.local_hits,
            self.remote_fetches,
            self.evictions,
            self.local_hit_rate() * 100.0
        )
    }
}
