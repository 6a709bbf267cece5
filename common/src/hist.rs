//! Log2 histogram slot math
//!
//! Written without loops so the same code passes the BPF verifier and runs
//! in the userspace engine.

use crate::constants::HIST_SLOTS;

/// `floor(log2(v))`, with `log2_floor(0) == 0`
#[inline(always)]
pub fn log2_floor(mut v: u64) -> u32 {
    let mut r = 0;
    if v >= 1 << 32 {
        v >>= 32;
        r += 32;
    }
    if v >= 1 << 16 {
        v >>= 16;
        r += 16;
    }
    if v >= 1 << 8 {
        v >>= 8;
        r += 8;
    }
    if v >= 1 << 4 {
        v >>= 4;
        r += 4;
    }
    if v >= 1 << 2 {
        v >>= 2;
        r += 2;
    }
    if v >= 1 << 1 {
        r += 1;
    }
    r
}

/// Histogram slot for a latency in microseconds, clamped to the last slot
#[inline(always)]
pub fn latency_slot(latency_us: u64) -> u32 {
    let slot = log2_floor(latency_us);
    if slot >= HIST_SLOTS {
        HIST_SLOTS - 1
    } else {
        slot
    }
}

/// Slot for the interval `[start_ns, now_ns]`
///
/// Returns `None` if the clock went backwards; such samples are dropped.
#[inline(always)]
pub fn slot_for_interval(start_ns: u64, now_ns: u64) -> Option<u32> {
    let delta_ns = now_ns.checked_sub(start_ns)?;
    Some(latency_slot(delta_ns / 1000))
}

/// Microsecond range covered by `slot`: `[low, high)`, `high == None` for the last slot
pub fn slot_bounds_us(slot: u32) -> (u64, Option<u64>) {
    let slot = if slot >= HIST_SLOTS { HIST_SLOTS - 1 } else { slot };
    let low = if slot == 0 { 0 } else { 1u64 << slot };
    let high = if slot == HIST_SLOTS - 1 {
        None
    } else {
        Some(1u64 << (slot + 1))
    };
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log2_floor() {
        assert_eq!(log2_floor(0), 0);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(2), 1);
        assert_eq!(log2_floor(3), 1);
        assert_eq!(log2_floor(4), 2);
        assert_eq!(log2_floor(500), 8);
        assert_eq!(log2_floor(1023), 9);
        assert_eq!(log2_floor(1024), 10);
        assert_eq!(log2_floor(u64::MAX), 63);
        for shift in 0..64 {
            assert_eq!(log2_floor(1u64 << shift), shift);
        }
    }

    #[test]
    fn test_slot_boundaries() {
        assert_eq!(latency_slot(0), 0);
        assert_eq!(latency_slot(1), 0);
        assert_eq!(latency_slot(2), 1);
        assert_eq!(latency_slot(3), 1);
        assert_eq!(latency_slot((1 << 23) - 1), 22);
        assert_eq!(latency_slot(1 << 23), 23);
        assert_eq!(latency_slot(1 << 40), 23);
        assert_eq!(latency_slot(u64::MAX), 23);
    }

    #[test]
    fn test_slot_for_interval() {
        assert_eq!(slot_for_interval(1_000_000_000, 1_000_500_000), Some(8));
        assert_eq!(slot_for_interval(10, 10), Some(0));
        // Sub-microsecond deltas land in slot 0
        assert_eq!(slot_for_interval(0, 999), Some(0));
        assert_eq!(slot_for_interval(5, 4), None);
    }

    #[test]
    fn test_slot_bounds() {
        assert_eq!(slot_bounds_us(0), (0, Some(2)));
        assert_eq!(slot_bounds_us(1), (2, Some(4)));
        assert_eq!(slot_bounds_us(8), (256, Some(512)));
        assert_eq!(slot_bounds_us(23), (1 << 23, None));

        // Every value maps into the range of its own slot
        for v in [0u64, 1, 2, 3, 7, 500, 65_535, 1 << 22, 1 << 23, 1 << 30] {
            let (low, high) = slot_bounds_us(latency_slot(v));
            assert!(v >= low);
            if let Some(high) = high {
                assert!(v < high);
            }
        }
    }
}
