//! BPF map definitions for handshake latency tracking
//!
//! Defines the maps shared between the three kprobes and read by
//! the userspace collector.

use aya_ebpf::{
    macros::map,
    maps::{Array, LruHashMap},
};
use connlat_common::{constants::*, types::ConnectionKey};

/// Half-open connections waiting for ESTABLISHED
///
/// Key: ConnectionKey (normalized 4-tuple)
/// Value: u64 timestamp in nanoseconds (bpf_ktime_get_ns)
///
/// LRU so that connections which never complete are evicted under
/// capacity pressure instead of blocking new inserts.
#[map]
pub static START: LruHashMap<ConnectionKey, u64> =
    LruHashMap::with_max_entries(MAX_PENDING, 0);

/// Log2 latency histogram in microseconds
///
/// Key: slot index (0..HIST_SLOTS)
/// Value: u64 counter, only ever incremented atomically
#[map]
pub static HIST: Array<u64> = Array::with_max_entries(HIST_SLOTS, 0);

/// Probe health counters
///
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static STATS: Array<u64> = Array::with_max_entries(MAX_STATS, 0);
