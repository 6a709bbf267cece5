//! Handshake tracker
//!
//! Userspace implementation of the kernel program's correlation logic:
//! entry events store a start timestamp under the normalized key, the
//! ESTABLISHED transition takes it back out and folds the elapsed time
//! into the histogram. All methods take `&self`, never block on unrelated
//! connections and do a bounded amount of work, so the tracker can be
//! shared by any number of threads standing in for CPUs.

use crate::{
    histogram::{HistogramSnapshot, LatencyHistogram},
    pending::{InsertOutcome, PendingTable},
    types::StatsSnapshot,
};
use connlat_common::{
    constants::*,
    hist::slot_for_interval,
    ConnectionKey, SockCommon,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to an entry event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Start timestamp stored (or refreshed)
    Stored,
    /// Table full, event dropped
    Rejected,
    /// Address family not IPv4/IPv6
    Unsupported,
}

/// What happened to a state transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Not a transition to ESTABLISHED
    Ignored,
    /// Address family not IPv4/IPv6
    Unsupported,
    /// No pending entry for this connection
    Miss,
    /// Completion timestamp earlier than the start, sample dropped
    ClockSkew,
    /// Sample recorded
    Recorded { slot: u32, latency_us: u64 },
}

/// Correlates entry and completion events into a latency histogram
pub struct HandshakeTracker {
    pending: PendingTable,
    histogram: LatencyHistogram,
    stats: [AtomicU64; MAX_STATS as usize],
    latest_ns: AtomicU64,
}

impl HandshakeTracker {
    /// Create a tracker whose pending table holds `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: PendingTable::with_capacity(capacity),
            histogram: LatencyHistogram::new(),
            stats: std::array::from_fn(|_| AtomicU64::new(0)),
            latest_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    fn bump(&self, stat_id: u32) {
        self.stats[stat_id as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn observe(&self, now_ns: u64) {
        self.latest_ns.fetch_max(now_ns, Ordering::Relaxed);
    }

    /// A request socket was queued on a listener
    ///
    /// `family` is the family of the hook that fired (IPv4 or IPv6 queue).
    pub fn on_connection_pending(&self, family: u16, req: &SockCommon, now_ns: u64) -> PendingOutcome {
        self.observe(now_ns);

        let key = match ConnectionKey::from_request(family, req) {
            Ok(key) => key,
            Err(_) => {
                self.bump(STAT_UNSUPPORTED_FAMILY);
                return PendingOutcome::Unsupported;
            }
        };

        match self.pending.insert(key, now_ns) {
            InsertOutcome::Inserted | InsertOutcome::Refreshed => {
                self.bump(STAT_PENDING_INSERTED);
                PendingOutcome::Stored
            }
            InsertOutcome::Rejected => {
                self.bump(STAT_PENDING_REJECTED);
                PendingOutcome::Rejected
            }
        }
    }

    /// A socket changed state
    pub fn on_state_transition(&self, sk: &SockCommon, new_state: u8, now_ns: u64) -> CompletionOutcome {
        if new_state != TCP_ESTABLISHED {
            return CompletionOutcome::Ignored;
        }
        self.observe(now_ns);
        self.bump(STAT_ESTABLISHED);

        let key = match ConnectionKey::from_sock(sk) {
            Ok(key) => key,
            Err(_) => {
                self.bump(STAT_UNSUPPORTED_FAMILY);
                return CompletionOutcome::Unsupported;
            }
        };

        let start_ns = match self.pending.take(&key) {
            Some(ts) => ts,
            None => {
                self.bump(STAT_MISSES);
                return CompletionOutcome::Miss;
            }
        };

        let slot = match slot_for_interval(start_ns, now_ns) {
            Some(slot) => slot,
            None => {
                self.bump(STAT_CLOCK_SKEW);
                return CompletionOutcome::ClockSkew;
            }
        };

        let latency_us = (now_ns - start_ns) / 1000;
        self.histogram.increment(slot);
        self.stats[STAT_LATENCY_SUM_US as usize].fetch_add(latency_us, Ordering::Relaxed);
        self.bump(STAT_RECORDED);

        CompletionOutcome::Recorded { slot, latency_us }
    }

    /// Current histogram counters
    pub fn histogram(&self) -> HistogramSnapshot {
        self.histogram.snapshot()
    }

    /// Number of connections waiting for ESTABLISHED
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Maximum number of connections that can wait at once
    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }

    /// Probe health counters
    pub fn stats(&self) -> StatsSnapshot {
        let counters: Vec<u64> = self.stats.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        StatsSnapshot::from_counters(&counters)
    }

    /// Newest event timestamp seen so far
    pub fn latest_ns(&self) -> u64 {
        self.latest_ns.load(Ordering::Relaxed)
    }

    /// Drop pending entries older than `ttl_ns` relative to the newest event
    pub fn purge_stale(&self, ttl_ns: u64) -> usize {
        let cutoff = self.latest_ns().saturating_sub(ttl_ns);
        self.pending.purge_older_than(cutoff)
    }
}

impl Default for HandshakeTracker {
    fn default() -> Self {
        Self::new(MAX_PENDING as usize)
    }
}
