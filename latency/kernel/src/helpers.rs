//! Helper functions for eBPF programs
//!
//! Provides safe wrappers around BPF helper functions and
//! the atomic counter updates shared by the handlers.

use aya_ebpf::{helpers::bpf_ktime_get_ns, maps::Array};
use core::sync::atomic::{AtomicU64, Ordering};

use connlat_common::constants::STAT_LATENCY_SUM_US;

use crate::maps::{HIST, STATS};

/// Get current monotonic timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Atomically add `value` to `map[index]`
///
/// Compiles to a BPF atomic add, so concurrent CPUs never lose updates.
#[inline(always)]
fn add(map: &Array<u64>, index: u32, value: u64) {
    if let Some(ptr) = map.get_ptr_mut(index) {
        unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(value, Ordering::Relaxed);
    }
}

/// Increment a statistics counter
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    add(&STATS, stat_id, 1);
}

/// Fold one latency sample into the histogram and the running sum
#[inline(always)]
pub fn record_latency(slot: u32, latency_us: u64) {
    add(&HIST, slot, 1);
    add(&STATS, STAT_LATENCY_SUM_US, latency_us);
}
