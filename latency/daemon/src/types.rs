//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! reporting and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from connlat_common)
//! - **Userspace Types**: Types used only in userspace for reporting and export

use crate::histogram::HistogramSnapshot;
use connlat_common::slot_bounds_us;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the connlat-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use connlat_common::constants;
    pub use connlat_common::sock::{Endpoints, NormalizeError, SockCommon};
    pub use connlat_common::types::ConnectionKey;
}

// Re-export commonly used kernel types at module level for convenience
pub use kernel::{ConnectionKey, SockCommon};

/// Probe health counters, one per STAT_* index
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Entry events stored
    pub pending_inserted: u64,
    /// Entry events dropped (table full)
    pub pending_rejected: u64,
    /// Events with an address family other than IPv4/IPv6
    pub unsupported_family: u64,
    /// Transitions to ESTABLISHED seen
    pub established: u64,
    /// ESTABLISHED transitions without a pending entry
    pub misses: u64,
    /// Samples discarded because the clock went backwards
    pub clock_skew: u64,
    /// Samples folded into the histogram
    pub recorded: u64,
    /// Sum of recorded latencies in microseconds
    pub latency_sum_us: u64,
}

impl StatsSnapshot {
    /// Build from counters indexed by the STAT_* constants
    pub fn from_counters(counters: &[u64]) -> Self {
        use connlat_common::constants::*;

        let at = |idx: u32| counters.get(idx as usize).copied().unwrap_or(0);
        Self {
            pending_inserted: at(STAT_PENDING_INSERTED),
            pending_rejected: at(STAT_PENDING_REJECTED),
            unsupported_family: at(STAT_UNSUPPORTED_FAMILY),
            established: at(STAT_ESTABLISHED),
            misses: at(STAT_MISSES),
            clock_skew: at(STAT_CLOCK_SKEW),
            recorded: at(STAT_RECORDED),
            latency_sum_us: at(STAT_LATENCY_SUM_US),
        }
    }
}

/// One histogram slot for export
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BucketReport {
    /// Slot index (log2 of the lower bound)
    pub slot: usize,
    /// Inclusive lower bound in microseconds
    pub low_us: u64,
    /// Exclusive upper bound in microseconds, absent for the last slot
    pub high_us: Option<u64>,
    /// Number of handshakes in this slot
    pub count: u64,
}

/// Latency percentiles estimated from the histogram (microseconds)
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: Option<u64>,
    /// 90th percentile
    pub p90: Option<u64>,
    /// 99th percentile
    pub p99: Option<u64>,
    /// 99.9th percentile
    pub p999: Option<u64>,
}

impl Percentiles {
    /// Estimate from a histogram snapshot
    pub fn from_snapshot(snapshot: &HistogramSnapshot) -> Self {
        Self {
            p50: snapshot.quantile_us(0.50),
            p90: snapshot.quantile_us(0.90),
            p99: snapshot.quantile_us(0.99),
            p999: snapshot.quantile_us(0.999),
        }
    }
}

/// Aggregated report for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LatencyMetrics {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of the observation window in seconds
    pub duration_seconds: u64,
    /// Where the numbers came from ("kernel" or "replay")
    pub source: String,
    /// Handshakes measured (sum of the histogram)
    pub total_handshakes: u64,
    /// Entries still waiting for ESTABLISHED
    pub pending_connections: usize,
    /// Cumulative histogram
    pub histogram: Vec<BucketReport>,
    /// Percentile estimates
    pub percentiles: Percentiles,
    /// Probe health counters
    pub stats: StatsSnapshot,
}

/// Convert a snapshot into export rows
pub fn bucket_reports(snapshot: &HistogramSnapshot) -> Vec<BucketReport> {
    snapshot
        .buckets()
        .map(|(slot, count)| {
            let (low_us, high_us) = slot_bounds_us(slot as u32);
            BucketReport {
                slot,
                low_us,
                high_us,
                count,
            }
        })
        .collect()
}

/// Render a histogram in the classic log2 table format
///
/// ```text
///      usecs               : count    distribution
///        256 -> 511        : 4        |****************************************|
/// ```
///
/// Leading and trailing empty slots are skipped.
pub fn render_log2_hist(snapshot: &HistogramSnapshot, unit: &str) -> String {
    const WIDTH: u64 = 40;

    let mut out = String::new();
    let counts: Vec<(usize, u64)> = snapshot.buckets().collect();
    let first = counts.iter().position(|(_, c)| *c > 0);
    let last = counts.iter().rposition(|(_, c)| *c > 0);
    let (first, last) = match (first, last) {
        (Some(first), Some(last)) => (first, last),
        _ => return out,
    };
    let max = counts.iter().map(|(_, c)| *c).max().unwrap_or(0).max(1);

    let _ = writeln!(out, "{:>10} {:<13} : count    distribution", unit, "");
    for &(slot, count) in &counts[first..=last] {
        let (low, high) = slot_bounds_us(slot as u32);
        let high = match high {
            Some(high) => (high - 1).to_string(),
            None => "inf".to_string(),
        };
        let stars = (count * WIDTH / max) as usize;
        let _ = writeln!(
            out,
            "{:>10} -> {:<10} : {:<8} |{:<40}|",
            low,
            high,
            count,
            "*".repeat(stars)
        );
    }
    out
}

/// Render the end-of-run summary
pub fn render_summary(metrics: &LatencyMetrics) -> String {
    let fmt = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| format!("<{}", v));
    let p = &metrics.percentiles;
    let stats = &metrics.stats;
    let mut out = String::new();

    out.push_str("============================================\n");
    out.push_str("             Summary Report\n");
    out.push_str("============================================\n\n");
    let _ = writeln!(out, "  Source:             {}", metrics.source);
    let _ = writeln!(out, "  Handshakes:         {}", metrics.total_handshakes);
    let _ = writeln!(out, "  Pending:            {}", metrics.pending_connections);
    let _ = writeln!(out, "  Duration:           {} seconds", metrics.duration_seconds);
    out.push_str("\n  Latency Percentiles (μs):\n");
    let _ = writeln!(out, "    p50:  {:>10}", fmt(p.p50));
    let _ = writeln!(out, "    p90:  {:>10}", fmt(p.p90));
    let _ = writeln!(out, "    p99:  {:>10}", fmt(p.p99));
    let _ = writeln!(out, "    p999: {:>10}", fmt(p.p999));
    out.push_str("\n  Probe Health:\n");
    for (name, value) in [
        ("pending inserted", stats.pending_inserted),
        ("pending rejected", stats.pending_rejected),
        ("unsupported family", stats.unsupported_family),
        ("established", stats.established),
        ("misses", stats.misses),
        ("clock skew", stats.clock_skew),
        ("recorded", stats.recorded),
    ] {
        let _ = writeln!(out, "    {:<19} {:>8}", format!("{}:", name), value);
    }
    out.push_str("\n============================================\n");
    out
}

/// IP address of a normalized key field, unwrapping IPv4-mapped addresses
pub fn key_addr(addr: &[u8; 16]) -> IpAddr {
    match ConnectionKey::mapped_v4(addr) {
        Some(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        None => IpAddr::V6(Ipv6Addr::from(*addr)),
    }
}

/// Convert ConnectionKey to string representation
///
/// String in format "local:port -> peer:port"
pub fn connection_key_to_string(key: &ConnectionKey) -> String {
    let fmt_endpoint = |addr: IpAddr, port: u16| match addr {
        IpAddr::V4(a) => format!("{}:{}", a, port),
        IpAddr::V6(a) => format!("[{}]:{}", a, port),
    };

    format!(
        "{} -> {}",
        fmt_endpoint(key_addr(&key.local_addr), key.local_port()),
        fmt_endpoint(key_addr(&key.peer_addr), key.peer_port())
    )
}
