//! Lock-free log2 latency histogram
//!
//! Userspace counterpart of the kernel `HIST` map: 24 atomic counters,
//! slot `i` covering `[2^i, 2^(i+1))` microseconds.

use connlat_common::{hist::latency_slot, hist::slot_bounds_us, HIST_SLOTS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of slots as a usize, for array sizing
pub const SLOTS: usize = HIST_SLOTS as usize;

/// Concurrent histogram updated from any thread
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; SLOTS],
}

impl LatencyHistogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Add one to `slot`, clamping out-of-range slots to the last one
    #[inline]
    pub fn increment(&self, slot: u32) {
        let idx = (slot as usize).min(SLOTS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latency in microseconds
    #[inline]
    pub fn record_us(&self, latency_us: u64) {
        self.increment(latency_slot(latency_us));
    }

    /// Read every slot
    ///
    /// Each load is atomic; the slots are not read at a single instant.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut counts = [0u64; SLOTS];
        for (count, bucket) in counts.iter_mut().zip(self.buckets.iter()) {
            *count = bucket.load(Ordering::Relaxed);
        }
        HistogramSnapshot { counts }
    }

    /// Zero all slots
    #[cfg(test)]
    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the histogram counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    counts: [u64; SLOTS],
}

impl HistogramSnapshot {
    /// Build from raw counts, e.g. read out of the kernel map
    pub fn from_counts(counts: [u64; SLOTS]) -> Self {
        Self { counts }
    }

    /// Ordered `(slot, count)` pairs
    pub fn buckets(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts.iter().copied().enumerate()
    }

    /// Count in one slot
    pub fn count(&self, slot: usize) -> u64 {
        self.counts.get(slot).copied().unwrap_or(0)
    }

    /// Total samples across all slots
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Counts added since `earlier`
    ///
    /// Counters are monotonic; a slot that went down (kernel program
    /// reloaded) is reported as its current value.
    pub fn delta_since(&self, earlier: &HistogramSnapshot) -> HistogramSnapshot {
        let mut counts = [0u64; SLOTS];
        for (i, count) in counts.iter_mut().enumerate() {
            let now = self.counts[i];
            let before = earlier.counts[i];
            *count = if now >= before { now - before } else { now };
        }
        HistogramSnapshot { counts }
    }

    /// Estimate the `q` quantile (0.0..=1.0) in microseconds
    ///
    /// Returns the exclusive upper bound of the slot holding the quantile,
    /// or the lower bound for the open-ended last slot.
    pub fn quantile_us(&self, q: f64) -> Option<u64> {
        let total = self.total();
        if total == 0 {
            return None;
        }

        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (slot, count) in self.buckets() {
            seen += count;
            if seen >= rank {
                let (low, high) = slot_bounds_us(slot as u32);
                return Some(high.unwrap_or(low));
            }
        }
        None
    }
}
